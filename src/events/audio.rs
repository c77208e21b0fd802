// Internal events flowing between the receive path, the per-speaker
// buffers, and the transcription submitter. All audio crosses these
// boundaries as owned byte buffers.

use std::time::SystemTime;

use bytes::Bytes;

use crate::model::types::{Speaker, Ssrc, UserId};

/// One decoded 20ms chunk from a remote speaker, as produced by the
/// decode pipeline. Out-of-order arrival is fine; the per-speaker
/// buffer concatenates in arrival order.
#[derive(Debug)]
pub(crate) struct DecodedAudio {
    pub ssrc: Ssrc,
    pub pcm: Vec<u8>,
    pub sequence: u16,
    pub timestamp: u32,
}

/// An op 5 speaking event, used to bind SSRCs to users and to
/// re-parent placeholder utterances.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpeakerBindingUpdate {
    pub ssrc: Ssrc,
    pub user_id: UserId,
    pub speaking: bool,
}

/// One flushed utterance, on its way to the STT provider. Flushing is
/// destructive: the buffer slot gave up these bytes.
#[derive(Debug)]
pub(crate) struct UtteranceAudio {
    pub speaker: Speaker,
    pub pcm: Bytes,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
}
