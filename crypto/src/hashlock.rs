//! Hashlock secrets.
//!
//! The provider picks a random R per invoice; the promise carries only its
//! hash until R is revealed to hermes.

use crate::hash::blake2b_256;
use crate::CryptoError;

/// Draw a fresh 32-byte R from the OS random source.
pub fn generate_r() -> Result<[u8; 32], CryptoError> {
    let mut r = [0u8; 32];
    getrandom::getrandom(&mut r).map_err(|e| CryptoError::Random(e.to_string()))?;
    Ok(r)
}

pub fn hashlock(r: &[u8]) -> [u8; 32] {
    blake2b_256(r)
}

pub fn verify_hashlock(r: &[u8], lock: &[u8]) -> bool {
    hashlock(r).as_slice() == lock
}
