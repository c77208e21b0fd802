// Text-to-speech over the provider's HTTP API: text plus a voice id in,
// an encoded audio stream out. The caller transcodes the result to
// 48kHz stereo PCM before it goes anywhere near the encoder.

use tracing::debug;

use crate::provider::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";
const TTS_MODEL_ID: &str = "eleven_multilingual_v2";

pub(crate) struct TtsClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl TtsClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url,
        }
    }

    /// Synthesizes `text` with the given voice. Returns whatever audio
    /// container the provider produces.
    pub async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, ProviderError> {
        let url = format!(
            "{}/v1/text-to-speech/{}",
            self.base_url.trim_end_matches('/'),
            voice_id
        );
        let response = self
            .http
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&serde_json::json!({
                "text": text,
                "model_id": TTS_MODEL_ID,
            }))
            .send()
            .await
            .map_err(ProviderError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let audio = response.bytes().await.map_err(ProviderError::Http)?;
        debug!("synthesized {} bytes of audio", audio.len());
        Ok(audio.to_vec())
    }
}
