// Packet encryption for the xsalsa20_poly1305_lite voice mode.
//
// The lite mode carries its nonce material inline: every encrypted
// payload ends with a 4-byte big-endian counter, and the 24-byte
// secretbox nonce is that counter followed by 20 zero bytes. The
// counter must never repeat within a session, which is why it is a
// full u32 rather than the 16-bit RTP sequence.

use crypto_secretbox::aead::{AeadInPlace, KeyInit};
use crypto_secretbox::{Tag, XSalsa20Poly1305};
use thiserror::Error;

pub(crate) const SECRET_KEY_SIZE: usize = 32;
pub(crate) const NONCE_SIZE: usize = 24;
pub(crate) const NONCE_TAIL_SIZE: usize = 4;
pub(crate) const TAG_SIZE: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum DecryptError {
    #[error("encrypted payload too short: {0} bytes")]
    TooShort(usize),
    #[error("authentication failed")]
    BadMac,
}

/// Seals and opens voice payloads under the session key from op 4.
pub(crate) struct PacketCrypto {
    cipher: XSalsa20Poly1305,
}

impl PacketCrypto {
    pub fn new(secret_key: &[u8; SECRET_KEY_SIZE]) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(secret_key.into()),
        }
    }

    fn nonce(counter_tail: [u8; NONCE_TAIL_SIZE]) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_TAIL_SIZE].copy_from_slice(&counter_tail);
        nonce
    }

    /// Encrypts `plaintext` under the given nonce counter. The result
    /// is `tag || ciphertext || counter-tail`, ready to append to an
    /// RTP header.
    pub fn seal(&self, plaintext: &[u8], counter: u32) -> Vec<u8> {
        let tail = counter.to_be_bytes();
        let nonce = Self::nonce(tail);

        let mut buffer = Vec::with_capacity(TAG_SIZE + plaintext.len() + NONCE_TAIL_SIZE);
        buffer.extend_from_slice(plaintext);
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce.into(), b"", &mut buffer)
            .expect("secretbox encryption is infallible for in-memory buffers");

        let mut sealed = Vec::with_capacity(TAG_SIZE + buffer.len() + NONCE_TAIL_SIZE);
        sealed.extend_from_slice(&tag);
        sealed.extend_from_slice(&buffer);
        sealed.extend_from_slice(&tail);
        sealed
    }

    /// Opens a sealed payload, reconstructing the nonce from the
    /// trailing counter bytes. A failed open is a soft error; callers
    /// drop the packet and keep the receive loop running.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, DecryptError> {
        if sealed.len() < TAG_SIZE + NONCE_TAIL_SIZE {
            return Err(DecryptError::TooShort(sealed.len()));
        }
        let (body, tail) = sealed.split_at(sealed.len() - NONCE_TAIL_SIZE);
        let (tag, ciphertext) = body.split_at(TAG_SIZE);

        let mut tail_bytes = [0u8; NONCE_TAIL_SIZE];
        tail_bytes.copy_from_slice(tail);
        let nonce = Self::nonce(tail_bytes);

        let mut buffer = ciphertext.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                &nonce.into(),
                b"",
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| DecryptError::BadMac)?;
        Ok(buffer)
    }
}
