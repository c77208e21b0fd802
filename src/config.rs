use std::path::PathBuf;
use std::time::Duration;

use tracing::Level;

use crate::model::utterance::UtteranceConfig;

/// Runtime configuration, read from the environment. Missing provider
/// credentials degrade features instead of failing: joins still work
/// with transcription disabled, and playback reports NotConfigured.
#[derive(Clone, Debug)]
pub struct Config {
    /// Discord bot token for the gateway connection.
    pub bot_token: Option<String>,
    /// Credential for the STT/TTS provider; required for transcription.
    pub provider_api_key: Option<String>,
    /// TTS voice selector; required for playback.
    pub preferred_voice_id: Option<String>,
    pub log_level: String,
    /// Where transcript JSON mirrors land.
    pub transcript_dir: PathBuf,
    /// Per-speaker silence flush timeout, milliseconds.
    pub silence_flush_ms: u64,
    /// Per-speaker utterance hard cap, milliseconds.
    pub utterance_max_ms: u64,
    /// STT model identifier passed to the provider.
    pub stt_model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_token: None,
            provider_api_key: None,
            preferred_voice_id: None,
            log_level: "info".to_string(),
            transcript_dir: PathBuf::from("./transcripts"),
            silence_flush_ms: 2000,
            utterance_max_ms: 10_000,
            stt_model: "scribe_v1".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bot_token: lookup("DISCANTO_BOT_TOKEN"),
            provider_api_key: lookup("DISCANTO_PROVIDER_API_KEY"),
            preferred_voice_id: lookup("DISCANTO_VOICE_ID"),
            log_level: lookup("DISCANTO_LOG_LEVEL").unwrap_or(defaults.log_level),
            transcript_dir: lookup("DISCANTO_TRANSCRIPT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.transcript_dir),
            silence_flush_ms: lookup("DISCANTO_SILENCE_FLUSH_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.silence_flush_ms),
            utterance_max_ms: lookup("DISCANTO_UTTERANCE_MAX_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.utterance_max_ms),
            stt_model: lookup("DISCANTO_STT_MODEL").unwrap_or(defaults.stt_model),
        }
    }

    pub fn log_level(&self) -> Level {
        match self.log_level.as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "debug" => Level::DEBUG,
            _ => Level::INFO,
        }
    }

    pub(crate) fn utterance_config(&self) -> UtteranceConfig {
        UtteranceConfig {
            silence_flush: Duration::from_millis(self.silence_flush_ms),
            max_duration: Duration::from_millis(self.utterance_max_ms),
        }
    }
}
