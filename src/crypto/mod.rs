//! Cryptographic utilities for the tunneling core.
//!
//! This module provides:
//! - BufferCryptor: the keystream-positioned AES-128-CTR cipher used by
//!   the datagram channels and the transmitter header obfuscation
//! - Random helpers for keys, IVs and identifiers

mod buffer_cryptor;

pub use buffer_cryptor::BufferCryptor;

/// AES-128 key length in bytes.
pub const KEY_SIZE: usize = 16;

/// Keystream position where server-originated traffic starts.
///
/// Clients cipher from position 0; servers from the midpoint of the
/// non-negative 64-bit range so the two directions never overlap within
/// the lifetime of a session key.
pub const SERVER_POSITION_BASE: i64 = 1 << 62;

/// Generate random bytes using a cryptographically secure RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate random bytes into a slice.
pub fn fill_random(dest: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(dest);
}

/// Generate a fresh unique identifier for channels and streams.
///
/// 64 bits of randomness rendered as hex; collision within one process
/// lifetime is negligible.
pub fn random_id(prefix: &str) -> String {
    format!("{}-{:016x}", prefix, rand::random::<u64>())
}

/// Generate a random non-negative keystream position usable as a header IV.
///
/// The top bit is cleared so the value parses back as a valid cipher
/// position on the receive side.
pub fn random_iv() -> i64 {
    (rand::random::<u64>() & (i64::MAX as u64)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let a: [u8; 16] = random_bytes();
        let b: [u8; 16] = random_bytes();
        assert_ne!(a, b);
    }

    #[test]
    fn test_random_id_prefix() {
        let id = random_id("chan");
        assert!(id.starts_with("chan-"));
        assert_eq!(id.len(), "chan-".len() + 16);
        assert_ne!(id, random_id("chan"));
    }

    #[test]
    fn test_random_iv_non_negative() {
        for _ in 0..64 {
            assert!(random_iv() >= 0);
        }
    }
}
