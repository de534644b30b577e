//! Keystream-positioned AES-128-CTR cipher.
//!
//! The channels treat the cipher as an infinite keystream derived from a
//! session key and XOR wire bytes against it at explicit byte offsets.
//! Both ends must agree on the position for every byte; positions are
//! carried on the wire, never negotiated.
//!
//! Reusing a (key, position) range breaks confidentiality. Callers enforce
//! uniqueness by deriving positions from a per-direction monotonic byte
//! counter under a single-writer discipline; this type stays stateless so
//! the same instance can serve any position the caller proves fresh.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

use crate::crypto::KEY_SIZE;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Stream cipher over arbitrary buffer ranges at explicit keystream offsets.
///
/// Encryption and decryption are the same XOR operation. The cryptor is
/// safe to share between tasks only under external serialization per
/// direction; channels guarantee that.
#[derive(Clone)]
pub struct BufferCryptor {
    key: [u8; KEY_SIZE],
}

impl BufferCryptor {
    /// Create a cryptor over a 16-byte AES key.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// XOR `buf[offset..end]` with the keystream starting at byte `position`.
    ///
    /// # Panics
    ///
    /// Panics on a negative `position` or an out-of-range `offset..end`;
    /// both are programming errors, not wire conditions.
    pub fn cipher_range(&self, buf: &mut [u8], offset: usize, end: usize, position: i64) {
        assert!(position >= 0, "keystream position must be non-negative");
        assert!(offset <= end && end <= buf.len(), "cipher range out of bounds");

        if offset == end {
            return;
        }

        let mut cipher = Aes128Ctr::new_from_slices(&self.key, &[0u8; 16])
            .expect("AES-128 key and IV lengths are fixed");
        cipher.seek(position as u64);
        cipher.apply_keystream(&mut buf[offset..end]);
    }

    /// XOR the whole buffer with the keystream starting at `position`.
    pub fn cipher(&self, buf: &mut [u8], position: i64) {
        let end = buf.len();
        self.cipher_range(buf, 0, end, position);
    }
}

impl std::fmt::Debug for BufferCryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCryptor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_SIZE] {
        *b"0123456789abcdef"
    }

    #[test]
    fn round_trip() {
        let cryptor = BufferCryptor::new(test_key());
        let original: Vec<u8> = (0u8..200).collect();
        let mut buf = original.clone();

        cryptor.cipher(&mut buf, 1234);
        assert_ne!(buf, original);

        cryptor.cipher(&mut buf, 1234);
        assert_eq!(buf, original);
    }

    #[test]
    fn deterministic_keystream() {
        let cryptor = BufferCryptor::new(test_key());
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];

        cryptor.cipher(&mut a, 99);
        cryptor.cipher(&mut b, 99);
        assert_eq!(a, b);

        let mut c = vec![0u8; 64];
        cryptor.cipher(&mut c, 100);
        assert_ne!(a, c);
    }

    #[test]
    fn position_is_a_byte_offset() {
        // Ciphering one long range must equal ciphering it piecewise at
        // the matching offsets, including offsets not aligned to the
        // 16-byte block size.
        let cryptor = BufferCryptor::new(test_key());
        let mut whole = vec![0u8; 100];
        cryptor.cipher(&mut whole, 1000);

        let mut pieces = vec![0u8; 100];
        cryptor.cipher_range(&mut pieces, 0, 7, 1000);
        cryptor.cipher_range(&mut pieces, 7, 40, 1007);
        cryptor.cipher_range(&mut pieces, 40, 100, 1040);
        assert_eq!(whole, pieces);
    }

    #[test]
    fn distinct_positions_never_overlap() {
        // Same plaintext at adjacent non-overlapping positions yields
        // unrelated ciphertext.
        let cryptor = BufferCryptor::new(test_key());
        let mut a = vec![0xAAu8; 32];
        let mut b = vec![0xAAu8; 32];
        cryptor.cipher(&mut a, 0);
        cryptor.cipher(&mut b, 32);
        assert_ne!(a, b);
    }

    #[test]
    #[should_panic(expected = "non-negative")]
    fn negative_position_fails_fast() {
        let cryptor = BufferCryptor::new(test_key());
        let mut buf = [0u8; 8];
        cryptor.cipher(&mut buf, -1);
    }

    #[test]
    fn empty_range_is_a_noop() {
        let cryptor = BufferCryptor::new(test_key());
        let mut buf = [7u8; 4];
        cryptor.cipher_range(&mut buf, 2, 2, 0);
        assert_eq!(buf, [7u8; 4]);
    }
}
