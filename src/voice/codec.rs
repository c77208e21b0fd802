// Opus encode/decode for the voice session: one encoder and one
// decoder per session, both 48kHz stereo with 20ms frames.

use audiopus::coder::{Decoder, Encoder};
use audiopus::{packet::Packet, Application, Bitrate, Channels, MutSignals, SampleRate};
use tracing::trace;

use crate::model::constants::{
    MAX_OPUS_PACKET_SIZE, STEREO_FRAME_BYTE_SIZE, STEREO_FRAME_SIZE,
};
use crate::model::types::DiscordAudioSample;

/// Voice-tuned bitrate; FEC stays off for bandwidth economy.
const ENCODER_BITRATE: Bitrate = Bitrate::BitsPerSecond(96_000);

/// Largest decode output: one 120ms stereo frame.
const MAX_DECODE_SAMPLES: usize = 6 * STEREO_FRAME_SIZE;

pub(crate) struct OpusEncoder {
    encoder: Encoder,
    opus_buf: Vec<u8>,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, audiopus::Error> {
        let mut encoder =
            Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Voip)?;
        encoder.set_bitrate(ENCODER_BITRATE)?;
        encoder.set_inband_fec(false)?;
        Ok(Self {
            encoder,
            opus_buf: vec![0u8; MAX_OPUS_PACKET_SIZE],
        })
    }

    /// Encodes exactly one 20ms stereo frame (960 samples per channel).
    pub fn encode_frame(
        &mut self,
        pcm: &[DiscordAudioSample],
    ) -> Result<Vec<u8>, audiopus::Error> {
        debug_assert_eq!(pcm.len(), STEREO_FRAME_SIZE);
        let written = self.encoder.encode(pcm, &mut self.opus_buf)?;
        Ok(self.opus_buf[..written].to_vec())
    }
}

pub(crate) struct OpusDecoder {
    decoder: Decoder,
    pcm_buf: Vec<DiscordAudioSample>,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, audiopus::Error> {
        Ok(Self {
            decoder: Decoder::new(SampleRate::Hz48000, Channels::Stereo)?,
            pcm_buf: vec![0; MAX_DECODE_SAMPLES],
        })
    }

    /// Decodes one Opus packet to s16le stereo PCM bytes. Missing and
    /// partial frames come back as 20ms of silence so the per-speaker
    /// buffer keeps its wall-clock alignment.
    pub fn decode_frame(&mut self, opus: &[u8]) -> Vec<u8> {
        let decoded = Packet::try_from(opus).and_then(|packet| {
            let signals = MutSignals::try_from(&mut self.pcm_buf[..])?;
            self.decoder.decode(Some(packet), signals, false)
        });
        match decoded {
            Ok(samples_per_channel) => {
                samples_to_pcm_bytes(&self.pcm_buf[..samples_per_channel * 2])
            }
            Err(e) => {
                trace!("opus decode failed, substituting silence: {}", e);
                silence_frame()
            }
        }
    }
}

/// 20ms of stereo PCM silence: 3,840 zero bytes.
pub(crate) fn silence_frame() -> Vec<u8> {
    vec![0u8; STEREO_FRAME_BYTE_SIZE]
}

pub(crate) fn pcm_bytes_to_samples(bytes: &[u8]) -> Vec<DiscordAudioSample> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub(crate) fn samples_to_pcm_bytes(samples: &[DiscordAudioSample]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frame() -> Vec<i16> {
        (0..STEREO_FRAME_SIZE)
            .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
            .collect()
    }

    #[test]
    fn encode_decode_round_trip_keeps_frame_size() {
        let mut encoder = OpusEncoder::new().unwrap();
        let mut decoder = OpusDecoder::new().unwrap();

        let opus = encoder.encode_frame(&sine_frame()).unwrap();
        assert!(!opus.is_empty());
        assert!(opus.len() <= MAX_OPUS_PACKET_SIZE);

        let pcm = decoder.decode_frame(&opus);
        assert_eq!(pcm.len(), STEREO_FRAME_BYTE_SIZE);
    }

    #[test]
    fn garbage_packet_decodes_to_exactly_20ms_of_silence() {
        let mut decoder = OpusDecoder::new().unwrap();
        let pcm = decoder.decode_frame(&[0xde, 0xad, 0xbe, 0xef, 0x01]);
        assert_eq!(pcm.len(), 3840);
        assert!(pcm.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn sample_byte_conversion_round_trips() {
        let samples: Vec<i16> = vec![0, 1, -1, i16::MAX, i16::MIN, 1234];
        let bytes = samples_to_pcm_bytes(&samples);
        assert_eq!(pcm_bytes_to_samples(&bytes), samples);
    }
}
