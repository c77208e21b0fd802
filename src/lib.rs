pub mod api {
    pub mod api_methods;
    pub mod api_types;
}
pub mod config;
mod audio {
    pub(crate) mod transcode;
}
mod events {
    pub(crate) mod audio;
}
mod gateway;
mod model {
    pub(crate) mod constants;
    pub(crate) mod speaker_map;
    pub(crate) mod transcript;
    pub(crate) mod types;
    pub(crate) mod utterance;
}
mod provider {
    pub(crate) mod error;
    pub(crate) mod stt;
    pub(crate) mod tts;

    pub(crate) use error::ProviderError;
}
mod voice {
    pub(crate) mod codec;
    pub(crate) mod crypto;
    pub(crate) mod payload;
    pub(crate) mod recv;
    pub(crate) mod rtp;
    pub(crate) mod send;
    pub(crate) mod session;
    pub(crate) mod udp;
}

pub use api::api_methods::{Discanto, EventCallback};
pub use api::api_types::{
    AudioInput, ClientError, ConnectData, JoinError, LeaveError, PlayError, TranscriptEntry,
    VoiceChannelEvent, VoiceStatus, WordInterval,
};
pub use config::Config;
