//! Nullable signer: deterministic signatures, recorded calls.

use std::sync::Mutex;

use tollgate_crypto::{blake2b_256_multi, CryptoError, Signer};
use tollgate_types::Identity;

/// Signs with a keyed hash of identity and message. Never fails unless told to.
#[derive(Default)]
pub struct NullSigner {
    signed: Mutex<Vec<(Identity, Vec<u8>)>>,
    fail: Mutex<bool>,
}

impl NullSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_signing(&self) {
        *self.fail.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = true;
    }

    /// Every (identity, message) pair signed so far.
    pub fn signed(&self) -> Vec<(Identity, Vec<u8>)> {
        self.signed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The signature [`NullSigner`] produces for `message`.
    pub fn signature_for(identity: &Identity, message: &[u8]) -> Vec<u8> {
        let digest = blake2b_256_multi(&[identity.as_str().as_bytes(), message]);
        let mut signature = Vec::with_capacity(65);
        signature.extend_from_slice(&digest);
        signature.extend_from_slice(&digest);
        signature.push(0x1b);
        signature
    }
}

impl Signer for NullSigner {
    fn sign(&self, identity: &Identity, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if *self.fail.lock().unwrap_or_else(std::sync::PoisonError::into_inner) {
            return Err(CryptoError::UnknownIdentity(identity.to_string()));
        }
        self.signed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((identity.clone(), message.to_vec()));
        Ok(Self::signature_for(identity, message))
    }
}
