// Speech-to-text over the provider's HTTP API. The endpoint is opaque:
// we upload a WAV, name a model, ask for word timestamps, and read back
// `{text, words}`. Failures are logged by the caller and never
// terminate the voice session.

use reqwest::multipart;
use serde_json::Value;
use tracing::debug;

use crate::api::api_types::WordInterval;
use crate::model::constants::{DISCORD_AUDIO_CHANNELS, DISCORD_SAMPLES_PER_SECOND};
use crate::provider::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";

#[derive(Debug)]
pub(crate) struct SttResult {
    pub text: String,
    pub words: Option<Vec<WordInterval>>,
}

pub(crate) struct SttClient {
    http: reqwest::Client,
    api_key: String,
    model_id: String,
    base_url: String,
}

impl SttClient {
    pub fn new(api_key: String, model_id: String) -> Self {
        Self::with_base_url(api_key, model_id, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, model_id: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            model_id,
            base_url,
        }
    }

    /// Transcribes 48kHz s16le stereo PCM. Word-level timestamps are
    /// requested; speaker diarization is not (we already know who is
    /// speaking from the SSRC binding).
    pub async fn transcribe(&self, pcm: &[u8]) -> Result<SttResult, ProviderError> {
        let wav = wav_from_pcm(
            pcm,
            DISCORD_SAMPLES_PER_SECOND as u32,
            DISCORD_AUDIO_CHANNELS as u16,
        );
        debug!("submitting {} byte wav for transcription", wav.len());

        let part = multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(ProviderError::Http)?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("model_id", self.model_id.clone())
            .text("timestamps_granularity", "word")
            .text("diarize", "false");

        let url = format!("{}/v1/speech-to-text", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .multipart(form)
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

        let json: Value = response.json().await.map_err(ProviderError::Http)?;
        parse_transcription(&json)
    }
}

/// Pulls `{text, words}` out of the provider response. Words are
/// reported in seconds; the transcript stores milliseconds.
pub(crate) fn parse_transcription(json: &Value) -> Result<SttResult, ProviderError> {
    let text = json["text"]
        .as_str()
        .ok_or_else(|| ProviderError::MalformedResponse("missing `text` field".to_string()))?
        .trim()
        .to_string();

    let words = json["words"].as_array().map(|words| {
        words
            .iter()
            .filter(|w| w["type"].as_str().unwrap_or("word") == "word")
            .filter_map(|w| {
                Some(WordInterval {
                    word: w["text"].as_str()?.to_string(),
                    start_ms: (w["start"].as_f64()? * 1000.0) as u64,
                    end_ms: (w["end"].as_f64()? * 1000.0) as u64,
                })
            })
            .collect::<Vec<_>>()
    });

    Ok(SttResult {
        text,
        words: words.filter(|w| !w.is_empty()),
    })
}

/// Wraps raw PCM in a minimal RIFF/WAVE header so the provider can
/// recognize the sample format.
pub(crate) fn wav_from_pcm(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * channels as u32 * 2;
    let block_align = channels * 2;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}
