//! Cryptographic primitives for Mirage Tunnel
//!
//! This module provides:
//! - Password stretching into a 256-bit session key (PBKDF2-HMAC-SHA256)
//! - AES-256-GCM and ChaCha20-Poly1305 AEAD with random nonces
//! - Secure random number generation

mod aead;
mod kdf;

pub use aead::{Cipher, Method};
pub use kdf::{derive_key, KDF_ITERATIONS, KDF_SALT};

use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes (both supported methods)
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unsupported cipher method: {0}")]
    UnsupportedMethod(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Malformed ciphertext: {0} bytes")]
    MalformedCiphertext(usize),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Random number generator failure")]
    Rng,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    SystemRandom::new().fill(buf).map_err(|_| CryptoError::Rng)
}

/// Draw a uniformly distributed value from `[low, high)`
///
/// Only small ranges are needed (padding lengths), so a single random byte
/// with rejection sampling is enough.
pub fn random_in_range(low: u8, high: u8) -> Result<u8, CryptoError> {
    debug_assert!(low < high);
    let span = high - low;
    // Largest multiple of span that fits in a byte
    let zone = u8::MAX - (u8::MAX % span);
    let mut b = [0u8; 1];
    loop {
        random_bytes(&mut b)?;
        if b[0] < zone {
            return Ok(low + b[0] % span);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1).unwrap();
        random_bytes(&mut buf2).unwrap();
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_random_in_range_bounds() {
        for _ in 0..2000 {
            let v = random_in_range(64, 255).unwrap();
            assert!((64..255).contains(&v));
        }
    }
}
