//! Key Derivation Functions
//!
//! Stretches the pre-shared password into the symmetric session key with
//! PBKDF2-HMAC-SHA256. Salt and iteration count are part of the wire
//! contract: both peers must use the same values.

use super::KEY_LEN;
use ring::pbkdf2;
use std::num::NonZeroU32;

/// Fixed application salt
pub const KDF_SALT: &[u8] = b"mirage-tunnel-pbkdf2-salt";

/// PBKDF2 iteration count
pub const KDF_ITERATIONS: u32 = 4096;

/// Derive a 32-byte key from a UTF-8 password
pub fn derive_key(password: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    let iterations = NonZeroU32::new(KDF_ITERATIONS).unwrap_or(NonZeroU32::MIN);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        KDF_SALT,
        password.as_bytes(),
        &mut key,
    );
    key
}
