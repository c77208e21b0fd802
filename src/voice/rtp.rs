// RTP framing for Discord voice.
//
// Every audio frame travels in a fixed 12-byte RTP header:
//
//   0       1   version/padding/extension/csrc  (0x80 for our packets)
//   1       1   marker/payload type             (0x78 = 120, Opus)
//   2       2   sequence (big-endian)
//   4       4   timestamp (big-endian, 48kHz sample ticks)
//   8       4   SSRC (big-endian)
//
// Direct byte serialization, no serde.

use crate::model::constants::{RTP_HEADER_LEN, RTP_PAYLOAD_TYPE_OPUS, RTP_VERSION};
use crate::model::types::Ssrc;

/// One-byte header extension profile marker (RFC 8285).
const EXTENSION_PROFILE: [u8; 2] = [0xbe, 0xde];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RtpHeader {
    pub version: u8,
    pub has_extension: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: Ssrc,
}

impl RtpHeader {
    /// Builds the header for an outgoing Opus frame. Marker and
    /// extension bits are always clear on the send side.
    pub fn for_send(sequence: u16, timestamp: u32, ssrc: Ssrc) -> Self {
        Self {
            version: RTP_VERSION,
            has_extension: false,
            payload_type: RTP_PAYLOAD_TYPE_OPUS,
            sequence,
            timestamp,
            ssrc,
        }
    }

    pub fn encode(&self) -> [u8; RTP_HEADER_LEN] {
        let mut buf = [0u8; RTP_HEADER_LEN];
        buf[0] = self.version << 6 | (self.has_extension as u8) << 4;
        buf[1] = self.payload_type;
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf
    }

    /// Parses a header from the front of a datagram. Rejects anything
    /// shorter than 12 bytes or not RTP version 2.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < RTP_HEADER_LEN {
            return None;
        }
        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return None;
        }
        Some(Self {
            version,
            has_extension: buf[0] & 0x10 != 0,
            payload_type: buf[1] & 0x7f,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

/// Strips a leading one-byte RTP header extension from decrypted
/// payload bytes, if present. The extension block is its 4-byte header
/// plus the declared number of 32-bit words; any padding belongs to the
/// declared length, so nothing past it is consumed.
pub(crate) fn strip_header_extension(plaintext: &[u8]) -> &[u8] {
    if plaintext.len() < 4 || plaintext[0..2] != EXTENSION_PROFILE {
        return plaintext;
    }
    let words = u16::from_be_bytes([plaintext[2], plaintext[3]]) as usize;
    let skip = 4 + words * 4;
    if skip > plaintext.len() {
        // malformed length; better to hand the decoder garbage than to panic
        return plaintext;
    }
    &plaintext[skip..]
}

/// Prepends a one-byte extension header carrying `words` words of zero
/// padding. Only exercised from tests, but kept next to the stripper so
/// the two stay in sync.
#[cfg(test)]
pub(crate) fn append_extension_header(payload: &[u8], words: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + words as usize * 4 + payload.len());
    out.extend_from_slice(&EXTENSION_PROFILE);
    out.extend_from_slice(&words.to_be_bytes());
    out.extend(std::iter::repeat(0u8).take(words as usize * 4));
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encode_layout_is_big_endian() {
        let header = RtpHeader::for_send(0x0102, 0x03040506, 0x0708090a);
        let bytes = header.encode();
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x78);
        assert_eq!(&bytes[2..4], &[0x01, 0x02]);
        assert_eq!(&bytes[4..8], &[0x03, 0x04, 0x05, 0x06]);
        assert_eq!(&bytes[8..12], &[0x07, 0x08, 0x09, 0x0a]);
    }

    #[test]
    fn header_round_trip() {
        let header = RtpHeader::for_send(42, 40320, 0xcafe);
        let decoded = RtpHeader::parse(&header.encode()).expect("valid header");
        assert_eq!(header, decoded);
    }

    #[test]
    fn parse_rejects_short_buffers() {
        assert!(RtpHeader::parse(&[0x80u8; 11]).is_none());
    }

    #[test]
    fn parse_rejects_wrong_version() {
        let mut bytes = RtpHeader::for_send(1, 960, 7).encode();
        bytes[0] = 0x00; // version 0: an IP discovery response starts this way
        assert!(RtpHeader::parse(&bytes).is_none());
        bytes[0] = 0x40; // version 1
        assert!(RtpHeader::parse(&bytes).is_none());
    }

    #[test]
    fn parse_reads_extension_bit() {
        let mut bytes = RtpHeader::for_send(1, 960, 7).encode();
        bytes[0] |= 0x10;
        let header = RtpHeader::parse(&bytes).unwrap();
        assert!(header.has_extension);
    }

    #[test]
    fn strip_extension_is_inverse_of_append() {
        for words in [0u16, 1, 3] {
            for payload in [&[0x01u8, 0x02, 0x03][..], &[0x00, 0xbe][..], &[0xff][..]] {
                let wrapped = append_extension_header(payload, words);
                assert_eq!(strip_header_extension(&wrapped), payload);
            }
        }
    }

    #[test]
    fn strip_leaves_plain_payload_alone() {
        let payload = [0x78u8, 0x01, 0x02];
        assert_eq!(strip_header_extension(&payload), &payload);
    }

    #[test]
    fn strip_tolerates_malformed_length() {
        // declared length runs past the end of the buffer
        let bad = [0xbe, 0xde, 0x7f, 0xff, 0x01, 0x02];
        assert_eq!(strip_header_extension(&bad), &bad);
    }
}
