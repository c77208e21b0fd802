// Outbound audio: PCM in, paced encrypted RTP out.
//
// The pipeline runs in two phases. `PlaybackPipeline::prepare` does all
// codec and crypto work eagerly, producing the full ordered packet
// queue, so nothing heavier than a UDP send happens between frames.
// `pace_frames` then emits one packet per 20ms against an absolute
// schedule (start + i * 20ms); a cumulative sleep loop would
// accumulate scheduler jitter until Discord's jitter buffer started
// dropping frames.

use std::io;
use std::num::Wrapping;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::model::constants::{
    FRAME_LENGTH, STEREO_FRAME_BYTE_SIZE, TIMESTAMP_STEP_PER_FRAME,
};
use crate::model::types::{RtpSequence, RtpTimestamp, Ssrc};
use crate::voice::codec::{pcm_bytes_to_samples, OpusEncoder};
use crate::voice::crypto::PacketCrypto;
use crate::voice::rtp::RtpHeader;

/// Minimum sleep between frames even when we're behind schedule.
const MIN_FRAME_DELAY: time::Duration = time::Duration::from_millis(1);

/// Owns the per-session send state: Opus encoder, sequence, timestamp,
/// and the nonce counter. Sequence and timestamp wrap; the nonce
/// counter is full-width so no nonce repeats within a session even
/// after the 16-bit sequence wraps.
pub(crate) struct PlaybackPipeline {
    encoder: OpusEncoder,
    crypto: Arc<PacketCrypto>,
    ssrc: Ssrc,
    sequence: RtpSequence,
    timestamp: RtpTimestamp,
    nonce_counter: u32,
}

impl PlaybackPipeline {
    pub fn new(crypto: Arc<PacketCrypto>, ssrc: Ssrc) -> Result<Self, audiopus::Error> {
        Ok(Self {
            encoder: OpusEncoder::new()?,
            crypto,
            ssrc,
            sequence: Wrapping(0),
            timestamp: Wrapping(0),
            nonce_counter: 0,
        })
    }

    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    /// Serializes a PCM byte stream into ready-to-send RTP packets:
    /// partition into 20ms frames (zero-padding the final partial one),
    /// Opus-encode, frame, seal. All frames are produced before any is
    /// transmitted.
    pub fn prepare(&mut self, pcm: &[u8]) -> Result<Vec<Vec<u8>>, audiopus::Error> {
        let mut packets = Vec::with_capacity(pcm.len() / STEREO_FRAME_BYTE_SIZE + 1);
        for frame_bytes in pcm.chunks(STEREO_FRAME_BYTE_SIZE) {
            let packet = if frame_bytes.len() == STEREO_FRAME_BYTE_SIZE {
                self.next_packet(frame_bytes)?
            } else {
                let mut padded = frame_bytes.to_vec();
                padded.resize(STEREO_FRAME_BYTE_SIZE, 0);
                self.next_packet(&padded)?
            };
            packets.push(packet);
        }
        debug!(
            "prepared {} frames from {} bytes of pcm",
            packets.len(),
            pcm.len()
        );
        Ok(packets)
    }

    fn next_packet(&mut self, frame_bytes: &[u8]) -> Result<Vec<u8>, audiopus::Error> {
        let samples = pcm_bytes_to_samples(frame_bytes);
        let opus = self.encoder.encode_frame(&samples)?;

        let header = RtpHeader::for_send(self.sequence.0, self.timestamp.0, self.ssrc);
        let sealed = self.crypto.seal(&opus, self.nonce_counter);

        self.sequence += Wrapping(1);
        self.timestamp += Wrapping(TIMESTAMP_STEP_PER_FRAME);
        self.nonce_counter = self.nonce_counter.wrapping_add(1);

        let mut packet = Vec::with_capacity(header.encode().len() + sealed.len());
        packet.extend_from_slice(&header.encode());
        packet.extend_from_slice(&sealed);
        Ok(packet)
    }
}

/// Emits packets at one per 20ms. Frame i targets `start + i * 20ms`
/// on the monotonic clock; each wakeup re-targets against that
/// schedule. Cancellation drains the rest of the queue; already-sent
/// frames are gone and not recallable. Returns how many frames went
/// out.
pub(crate) async fn pace_frames(
    socket: &UdpSocket,
    packets: Vec<Vec<u8>>,
    shutdown_token: &CancellationToken,
) -> io::Result<usize> {
    let start = Instant::now();
    let mut sent = 0usize;

    for (i, packet) in packets.iter().enumerate() {
        let target = start + FRAME_LENGTH * i as u32;
        let wakeup = target.max(Instant::now() + MIN_FRAME_DELAY);
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                trace!("playback cancelled with {} frames unsent", packets.len() - sent);
                return Ok(sent);
            }
            _ = time::sleep_until(wakeup) => {}
        }
        socket.send(packet).await?;
        sent += 1;
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::crypto::{NONCE_TAIL_SIZE, SECRET_KEY_SIZE};
    use crate::voice::rtp::RtpHeader;

    fn pipeline() -> PlaybackPipeline {
        let crypto = Arc::new(PacketCrypto::new(&[7u8; SECRET_KEY_SIZE]));
        PlaybackPipeline::new(crypto, 0xbeef).unwrap()
    }

    fn tail_of(packet: &[u8]) -> u32 {
        let tail = &packet[packet.len() - NONCE_TAIL_SIZE..];
        u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]])
    }

    #[test]
    fn one_second_of_pcm_is_fifty_frames() {
        let mut pipeline = pipeline();
        let pcm = vec![0u8; STEREO_FRAME_BYTE_SIZE * 50];
        let packets = pipeline.prepare(&pcm).unwrap();
        assert_eq!(packets.len(), 50);
    }

    #[test]
    fn partial_final_frame_is_zero_padded_not_dropped() {
        let mut pipeline = pipeline();
        let pcm = vec![1u8; STEREO_FRAME_BYTE_SIZE + 100];
        let packets = pipeline.prepare(&pcm).unwrap();
        assert_eq!(packets.len(), 2);
    }

    #[test]
    fn sequence_and_timestamp_increment_per_frame() {
        let mut pipeline = pipeline();
        let pcm = vec![0u8; STEREO_FRAME_BYTE_SIZE * 3];
        let packets = pipeline.prepare(&pcm).unwrap();
        let headers: Vec<RtpHeader> = packets
            .iter()
            .map(|p| RtpHeader::parse(p).unwrap())
            .collect();
        for pair in headers.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence.wrapping_add(1));
            assert_eq!(pair[1].timestamp, pair[0].timestamp.wrapping_add(960));
        }
        assert_eq!(headers[0].ssrc, 0xbeef);
    }

    #[test]
    fn sequence_wrap_keeps_nonces_unique() {
        let mut pipeline = pipeline();
        pipeline.sequence = Wrapping(0xfffe);
        pipeline.timestamp = Wrapping(u32::MAX - 960);
        pipeline.nonce_counter = 0xfffe;

        let pcm = vec![0u8; STEREO_FRAME_BYTE_SIZE * 4];
        let packets = pipeline.prepare(&pcm).unwrap();
        let sequences: Vec<u16> = packets
            .iter()
            .map(|p| RtpHeader::parse(p).unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![0xfffe, 0xffff, 0x0000, 0x0001]);

        // the nonce tail keeps counting through the wrap
        let tails: Vec<u32> = packets.iter().map(|p| tail_of(p)).collect();
        assert_eq!(tails, vec![0xfffe, 0xffff, 0x10000, 0x10001]);
    }

    #[test]
    fn state_continues_across_prepare_calls() {
        let mut pipeline = pipeline();
        let first = pipeline.prepare(&vec![0u8; STEREO_FRAME_BYTE_SIZE * 2]).unwrap();
        let second = pipeline.prepare(&vec![0u8; STEREO_FRAME_BYTE_SIZE]).unwrap();
        let last_of_first = RtpHeader::parse(first.last().unwrap()).unwrap();
        let first_of_second = RtpHeader::parse(&second[0]).unwrap();
        assert_eq!(
            first_of_second.sequence,
            last_of_first.sequence.wrapping_add(1)
        );
    }

    #[tokio::test]
    async fn pacing_spreads_frames_over_time() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.connect(receiver.local_addr().unwrap()).await.unwrap();

        let packets: Vec<Vec<u8>> = (0..5).map(|i| vec![i as u8; 40]).collect();
        let token = CancellationToken::new();

        let started = std::time::Instant::now();
        let sent = pace_frames(&sender, packets, &token).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(sent, 5);
        // five frames at one per 20ms: at least 4 inter-frame gaps
        assert!(elapsed >= std::time::Duration::from_millis(75), "{:?}", elapsed);

        let mut buf = [0u8; 64];
        for _ in 0..5 {
            receiver.recv(&mut buf).await.unwrap();
        }
    }

    #[tokio::test]
    async fn cancellation_stops_unsent_frames() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.connect(receiver.local_addr().unwrap()).await.unwrap();

        let packets: Vec<Vec<u8>> = (0..100).map(|_| vec![0u8; 40]).collect();
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let sent = pace_frames(&sender, packets, &token).await.unwrap();
        assert!(sent < 100, "cancel should have cut playback short");
        assert!(sent >= 1);
    }
}
