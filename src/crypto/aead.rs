//! AEAD encryption/decryption
//!
//! Every sealed message is self-contained: `nonce || ciphertext || tag`.
//! The nonce is drawn from the system CSPRNG on every call, so one key can
//! be shared by any number of streams and process restarts without nonce
//! bookkeeping.

use super::{derive_key, random_bytes, CryptoError, KEY_LEN, NONCE_LEN};
use bytes::BufMut;
use ring::aead::{Aad, Algorithm, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};
use std::fmt;
use std::str::FromStr;

/// Supported AEAD constructions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// AES-256 in Galois/Counter Mode
    #[default]
    Aes256Gcm,
    /// ChaCha20 stream cipher with Poly1305 MAC
    ChaCha20Poly1305,
}

impl Method {
    /// Canonical method identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Aes256Gcm => "aes-256-gcm",
            Method::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    fn algorithm(&self) -> &'static Algorithm {
        match self {
            Method::Aes256Gcm => &AES_256_GCM,
            Method::ChaCha20Poly1305 => &CHACHA20_POLY1305,
        }
    }
}

impl FromStr for Method {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-gcm" => Ok(Method::Aes256Gcm),
            "chacha20-poly1305" => Ok(Method::ChaCha20Poly1305),
            _ => Err(CryptoError::UnsupportedMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// AEAD cipher bound to one derived key
pub struct Cipher {
    method: Method,
    key: LessSafeKey,
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(method: Method, key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(method.algorithm(), key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            method,
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Create a cipher whose key is stretched from `password`
    pub fn from_password(method: Method, password: &str) -> Result<Self, CryptoError> {
        Self::new(method, &derive_key(password))
    }

    /// The AEAD construction in use
    pub fn method(&self) -> Method {
        self.method
    }

    /// Nonce length prefixed to every ciphertext
    pub fn nonce_size(&self) -> usize {
        self.key.algorithm().nonce_len()
    }

    /// Authentication tag length appended to every ciphertext
    pub fn overhead(&self) -> usize {
        self.key.algorithm().tag_len()
    }

    /// Total size of a sealed message carrying `plaintext_len` bytes
    pub fn sealed_len(&self, plaintext_len: usize) -> usize {
        self.nonce_size() + plaintext_len + self.overhead()
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext || tag`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::with_capacity(self.sealed_len(plaintext.len()));
        self.encrypt_into(plaintext, &mut out)?;
        Ok(out)
    }

    /// Encrypt `plaintext`, appending the sealed message to `out`
    pub fn encrypt_into<B>(&self, plaintext: &[u8], out: &mut B) -> Result<(), CryptoError>
    where
        B: BufMut + AsMut<[u8]>,
    {
        let mut nonce = [0u8; NONCE_LEN];
        random_bytes(&mut nonce)?;

        let start = out.as_mut().len();
        out.put_slice(&nonce);
        out.put_slice(plaintext);

        let body = &mut out.as_mut()[start + NONCE_LEN..];
        let tag = self
            .key
            .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), body)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        out.put_slice(tag.as_ref());

        Ok(())
    }

    /// Decrypt a sealed message produced by [`Cipher::encrypt`]
    ///
    /// Never returns partial plaintext: either the tag verifies and the
    /// whole plaintext comes back, or the call fails.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_len = self.nonce_size();
        if ciphertext.len() < nonce_len {
            return Err(CryptoError::MalformedCiphertext(ciphertext.len()));
        }

        let (nonce, sealed) = ciphertext.split_at(nonce_len);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce).map_err(|_| CryptoError::AuthenticationFailed)?;

        let mut buffer = sealed.to_vec();
        let plaintext_len = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::AuthenticationFailed)?
            .len();
        buffer.truncate(plaintext_len);

        Ok(buffer)
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").field("method", &self.method).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TAG_LEN;
    use std::collections::HashSet;

    fn both_methods() -> [Method; 2] {
        [Method::Aes256Gcm, Method::ChaCha20Poly1305]
    }

    #[test]
    fn test_cipher_encrypt_decrypt() {
        for method in both_methods() {
            let cipher = Cipher::from_password(method, "secret").unwrap();
            let plaintext = b"Hello, World!";

            let ciphertext = cipher.encrypt(plaintext).unwrap();
            assert_eq!(ciphertext.len(), NONCE_LEN + plaintext.len() + TAG_LEN);

            let decrypted = cipher.decrypt(&ciphertext).unwrap();
            assert_eq!(&decrypted, plaintext);
        }
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("aes-256-gcm".parse::<Method>().unwrap(), Method::Aes256Gcm);
        assert_eq!(
            "CHACHA20-POLY1305".parse::<Method>().unwrap(),
            Method::ChaCha20Poly1305
        );
        assert!(matches!(
            "rc4-md5".parse::<Method>(),
            Err(CryptoError::UnsupportedMethod(_))
        ));
        assert_eq!(Method::ChaCha20Poly1305.to_string(), "chacha20-poly1305");
    }

    #[test]
    fn test_tamper_detection() {
        let cipher = Cipher::from_password(Method::Aes256Gcm, "secret").unwrap();
        let ciphertext = cipher.encrypt(b"attack at dawn").unwrap();

        for byte in 0..ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = ciphertext.clone();
                tampered[byte] ^= 1 << bit;
                assert!(matches!(
                    cipher.decrypt(&tampered),
                    Err(CryptoError::AuthenticationFailed)
                ));
            }
        }
    }

    #[test]
    fn test_short_ciphertext() {
        let cipher = Cipher::from_password(Method::ChaCha20Poly1305, "secret").unwrap();
        assert!(matches!(
            cipher.decrypt(&[0u8; 5]),
            Err(CryptoError::MalformedCiphertext(5))
        ));
    }

    #[test]
    fn test_wrong_key_or_method() {
        let sender = Cipher::from_password(Method::Aes256Gcm, "secret").unwrap();
        let wrong_key = Cipher::from_password(Method::Aes256Gcm, "other").unwrap();
        let wrong_method = Cipher::from_password(Method::ChaCha20Poly1305, "secret").unwrap();

        let ciphertext = sender.encrypt(b"payload").unwrap();
        assert!(matches!(
            wrong_key.decrypt(&ciphertext),
            Err(CryptoError::AuthenticationFailed)
        ));
        assert!(matches!(
            wrong_method.decrypt(&ciphertext),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_nonce_uniqueness() {
        let cipher = Cipher::from_password(Method::Aes256Gcm, "secret").unwrap();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(cipher.encrypt(b"same plaintext").unwrap()));
        }
    }
}
