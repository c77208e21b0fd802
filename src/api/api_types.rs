use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::types::{ChannelId, GuildId, UserId};

/// One word of a transcription with its timing, when the STT provider
/// reports word-level intervals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WordInterval {
    pub word: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// One finalized line of the transcript. Append-only; the display name
/// is resolved when the entry is created and never back-patched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Discord user id of the speaker, if their SSRC was ever bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub username: String,
    pub text: String,
    /// Unix milliseconds when the utterance started.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordInterval>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<GuildId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
}

/// Answer to `voice_status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStatus {
    pub in_voice: bool,
    pub guild_id: Option<GuildId>,
    pub channel_id: Option<ChannelId>,
    /// Distinct users currently bound to an audio stream.
    pub speaker_count: usize,
    pub transcription_enabled: bool,
    /// Received packets dropped because decryption failed.
    pub dropped_packets: u64,
}

impl VoiceStatus {
    pub(crate) fn idle(transcription_enabled: bool) -> Self {
        Self {
            in_voice: false,
            guild_id: None,
            channel_id: None,
            speaker_count: 0,
            transcription_enabled,
            dropped_packets: 0,
        }
    }
}

/// Details of an established voice connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectData {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    /// Unique string describing this session for validation purposes.
    pub session_id: String,
    /// The domain name of the Discord voice server we attached to.
    pub endpoint: String,
}

/// Events surfaced to the embedding application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum VoiceChannelEvent {
    Connect(ConnectData),
    Disconnect { guild_id: GuildId },
    /// A user started or stopped speaking (from op 5 updates).
    SpeakingStateChange { user_id: UserId, speaking: bool },
    Transcription(TranscriptEntry),
}

/// Raw audio handed to `play_audio`.
#[derive(Clone, Debug)]
pub enum AudioInput {
    /// 48kHz 16-bit little-endian stereo PCM, ready to encode.
    Pcm(Vec<u8>),
    /// Any container/codec ffmpeg can read; transcoded before playback.
    Encoded(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no bot token configured")]
    MissingToken,
    #[error("gateway connection failed: {0}")]
    Gateway(String),
}

#[derive(Debug, Error)]
pub enum JoinError {
    /// The gateway did not deliver both voice dispatches in time.
    #[error("timed out waiting for voice state/server updates")]
    GatewayTimeout,
    #[error("no authenticated gateway connection")]
    NotAuthenticated,
    #[error("already connected to a voice channel")]
    AlreadyInVoice,
    #[error("voice connection failed: {0}")]
    Connection(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeaveError {
    #[error("not connected to a voice channel")]
    NotInVoice,
}

#[derive(Debug, Error)]
pub enum PlayError {
    /// The session never became Active within the allowed wait.
    #[error("voice session is not ready")]
    NotReady,
    /// Another playback is in flight; this call is rejected, not queued.
    #[error("another playback is in progress")]
    Busy,
    #[error("audio transport error: {0}")]
    TransportError(String),
    /// Playback requires a configured TTS voice / provider credential.
    #[error("playback is not configured: {0}")]
    NotConfigured(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_entry_omits_absent_optionals() {
        let entry = TranscriptEntry {
            user_id: None,
            username: "Speaker_00000001".to_string(),
            text: "hi".to_string(),
            timestamp: 123,
            words: None,
            guild_id: None,
            channel_id: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("user_id").is_none());
        assert!(json.get("words").is_none());
        assert!(json.get("guild_id").is_none());
        assert_eq!(json["username"], "Speaker_00000001");
    }

    #[test]
    fn events_round_trip_as_json() {
        let event = VoiceChannelEvent::SpeakingStateChange {
            user_id: 7,
            speaking: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: VoiceChannelEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
