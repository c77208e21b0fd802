// Inbound audio: UDP datagrams in, per-speaker PCM chunks out.
//
// Classification order matters: IP discovery responses share the socket
// with audio and must never reach the decoder, and Discord mixes RTCP
// into the same flow. Decryption failures are soft errors; the loop
// drops the packet, counts it, and keeps going.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::events::audio::DecodedAudio;
use crate::model::constants::{RTP_HEADER_LEN, RTP_PAYLOAD_TYPE_OPUS, SILENT_FRAME};
use crate::voice::codec::{silence_frame, OpusDecoder};
use crate::voice::crypto::PacketCrypto;
use crate::voice::rtp::{strip_header_extension, RtpHeader};
use crate::voice::udp::is_discovery_datagram;

pub(crate) struct ReceivePipeline {
    crypto: Arc<PacketCrypto>,
    decoder: OpusDecoder,
    dropped_packets: Arc<AtomicU64>,
}

impl ReceivePipeline {
    pub fn new(
        crypto: Arc<PacketCrypto>,
        dropped_packets: Arc<AtomicU64>,
    ) -> Result<Self, audiopus::Error> {
        Ok(Self {
            crypto,
            decoder: OpusDecoder::new()?,
            dropped_packets,
        })
    }

    /// Runs one datagram through the pipeline. `None` means the packet
    /// was not audio (discovery, RTCP, malformed) or failed to open.
    pub fn process_datagram(&mut self, datagram: &[u8]) -> Option<DecodedAudio> {
        if is_discovery_datagram(datagram) {
            return None;
        }
        let header = RtpHeader::parse(datagram)?;
        if header.payload_type != RTP_PAYLOAD_TYPE_OPUS {
            // RTCP and retransmission traffic share the flow
            trace!("dropping non-opus payload type {}", header.payload_type);
            return None;
        }

        let plaintext = match self.crypto.open(&datagram[RTP_HEADER_LEN..]) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.dropped_packets.fetch_add(1, Ordering::Relaxed);
                trace!("dropping undecryptable packet from ssrc {}: {}", header.ssrc, e);
                return None;
            }
        };

        // keepalive/silence markers don't go through the decoder; they
        // become 20ms of PCM silence so buffers stay time-aligned
        let pcm = if plaintext.len() <= 3 || plaintext == SILENT_FRAME {
            silence_frame()
        } else {
            let opus = strip_header_extension(&plaintext);
            self.decoder.decode_frame(opus)
        };

        Some(DecodedAudio {
            ssrc: header.ssrc,
            pcm,
            sequence: header.sequence,
            timestamp: header.timestamp,
        })
    }
}

/// Drives the pipeline from the socket until cancelled. Handoff to the
/// per-speaker buffer is a single ownership transfer of the PCM buffer.
pub(crate) fn spawn_receive_loop(
    socket: Arc<UdpSocket>,
    crypto: Arc<PacketCrypto>,
    tx_audio: UnboundedSender<DecodedAudio>,
    dropped_packets: Arc<AtomicU64>,
    shutdown_token: CancellationToken,
) -> Result<JoinHandle<()>, audiopus::Error> {
    let mut pipeline = ReceivePipeline::new(crypto, dropped_packets)?;
    Ok(tokio::spawn(async move {
        let mut buf = [0u8; 1536];
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => return,
                received = socket.recv(&mut buf) => {
                    let n = match received {
                        Ok(n) => n,
                        Err(e) => {
                            warn!("voice UDP receive error: {}", e);
                            continue;
                        }
                    };
                    if let Some(audio) = pipeline.process_datagram(&buf[..n]) {
                        if tx_audio.send(audio).is_err() {
                            // buffer side has shut down; nothing left to do
                            return;
                        }
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::constants::{STEREO_FRAME_BYTE_SIZE, STEREO_FRAME_SIZE};
    use crate::voice::crypto::SECRET_KEY_SIZE;
    use crate::voice::rtp::append_extension_header;
    use crate::voice::send::PlaybackPipeline;
    use crate::voice::udp::discovery_request;

    fn crypto() -> Arc<PacketCrypto> {
        Arc::new(PacketCrypto::new(&[7u8; SECRET_KEY_SIZE]))
    }

    fn pipeline() -> (ReceivePipeline, Arc<AtomicU64>) {
        let dropped = Arc::new(AtomicU64::new(0));
        (ReceivePipeline::new(crypto(), dropped.clone()).unwrap(), dropped)
    }

    fn packet_with_payload(plaintext: &[u8], sequence: u16, ssrc: u32) -> Vec<u8> {
        let header = RtpHeader::for_send(sequence, 960, ssrc);
        let sealed = crypto().seal(plaintext, sequence as u32);
        let mut packet = header.encode().to_vec();
        packet.extend_from_slice(&sealed);
        packet
    }

    #[test]
    fn our_own_packets_round_trip_through_the_receive_path() {
        let mut sender = PlaybackPipeline::new(crypto(), 1234).unwrap();
        let packets = sender
            .prepare(&vec![0x11u8; STEREO_FRAME_BYTE_SIZE * 2])
            .unwrap();

        let (mut receive, dropped) = pipeline();
        for (i, packet) in packets.iter().enumerate() {
            let audio = receive.process_datagram(packet).expect("valid audio packet");
            assert_eq!(audio.ssrc, 1234);
            assert_eq!(audio.sequence, i as u16);
            assert_eq!(audio.pcm.len(), STEREO_FRAME_BYTE_SIZE);
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn discovery_datagrams_never_reach_the_audio_path() {
        let (mut receive, _) = pipeline();
        assert!(receive.process_datagram(&discovery_request(1234)).is_none());
    }

    #[test]
    fn short_and_wrong_version_datagrams_are_dropped() {
        let (mut receive, dropped) = pipeline();
        assert!(receive.process_datagram(&[0x80u8; 11]).is_none());
        let mut not_rtp = packet_with_payload(b"some payload", 1, 2);
        not_rtp[0] = 0x40;
        assert!(receive.process_datagram(&not_rtp).is_none());
        // neither counts as a decryption failure
        assert_eq!(dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn non_opus_payload_types_are_filtered() {
        let mut packet = packet_with_payload(b"rtcp-ish", 1, 2);
        packet[1] = 0xc8; // RTCP sender report
        let (mut receive, _) = pipeline();
        assert!(receive.process_datagram(&packet).is_none());
    }

    #[test]
    fn undecryptable_packets_bump_the_counter_and_continue() {
        let mut packet = packet_with_payload(b"legit", 1, 2);
        let tag_start = RTP_HEADER_LEN;
        packet[tag_start] ^= 0xff;
        let (mut receive, dropped) = pipeline();
        assert!(receive.process_datagram(&packet).is_none());
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn tiny_plaintexts_become_exactly_20ms_of_silence() {
        let (mut receive, _) = pipeline();
        for plaintext in [&[][..], &[0x01][..], &SILENT_FRAME[..]] {
            let packet = packet_with_payload(plaintext, 3, 77);
            let audio = receive.process_datagram(&packet).unwrap();
            assert_eq!(audio.pcm.len(), 3840);
            assert!(audio.pcm.iter().all(|b| *b == 0));
            assert_eq!(audio.ssrc, 77);
        }
    }

    #[test]
    fn header_extensions_are_stripped_before_decode() {
        // a real opus frame wrapped in a one-byte extension block must
        // decode like the bare frame, not fall back to silence length
        let mut encoder = crate::voice::codec::OpusEncoder::new().unwrap();
        let samples: Vec<i16> = (0..STEREO_FRAME_SIZE)
            .map(|i| ((i as f32 * 0.03).sin() * 9000.0) as i16)
            .collect();
        let opus = encoder.encode_frame(&samples).unwrap();
        let extended = append_extension_header(&opus, 2);

        let packet = packet_with_payload(&extended, 9, 55);
        let (mut receive, _) = pipeline();
        let audio = receive.process_datagram(&packet).unwrap();
        assert_eq!(audio.pcm.len(), STEREO_FRAME_BYTE_SIZE);
        assert!(audio.pcm.iter().any(|b| *b != 0));
    }
}
