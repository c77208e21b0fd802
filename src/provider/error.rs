use thiserror::Error;

/// Failures talking to the TTS/STT providers. All of these are
/// transient from the voice session's point of view: the caller logs
/// them and the session keeps running.
#[derive(Debug, Error)]
pub(crate) enum ProviderError {
    #[error("provider transport error: {0}")]
    Http(reqwest::Error),

    #[error("provider returned HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("provider response was malformed: {0}")]
    MalformedResponse(String),
}
