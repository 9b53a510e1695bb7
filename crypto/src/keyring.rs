//! Per-identity encryption keys.

use std::collections::HashMap;

use tollgate_types::{Address, Identity};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::encryption::{open, seal};
use crate::hash::blake2b_256;
use crate::CryptoError;

/// Asymmetric encryption addressed by identity.
///
/// Used to seal R-recovery payloads that hermes stores on the provider's
/// behalf and hands back when the provider loses track of an R.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, identity: &Identity, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, identity: &Identity, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// The identity owning an X25519 public key: the last 20 bytes of its Blake2b hash.
pub fn identity_from_public(public: &X25519Public) -> Identity {
    let digest = blake2b_256(public.as_bytes());
    Identity::from(Address::from_bytes(&digest[12..]))
}

/// In-process key store mapping identities to their X25519 secrets.
#[derive(Default)]
pub struct Keyring {
    keys: HashMap<Identity, StaticSecret>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key from its 32-byte secret and return the identity it belongs to.
    pub fn insert_secret(&mut self, secret: [u8; 32]) -> Identity {
        let secret = StaticSecret::from(secret);
        let identity = identity_from_public(&X25519Public::from(&secret));
        self.keys.insert(identity.clone(), secret);
        identity
    }

    /// Generate a new key and return its identity.
    pub fn generate(&mut self) -> Result<Identity, CryptoError> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).map_err(|e| CryptoError::Random(e.to_string()))?;
        Ok(self.insert_secret(seed))
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.keys.keys()
    }

    pub fn public_key(&self, identity: &Identity) -> Result<X25519Public, CryptoError> {
        self.secret(identity).map(X25519Public::from)
    }

    fn secret(&self, identity: &Identity) -> Result<&StaticSecret, CryptoError> {
        self.keys
            .get(identity)
            .ok_or_else(|| CryptoError::UnknownIdentity(identity.to_string()))
    }
}

impl Encryptor for Keyring {
    fn encrypt(&self, identity: &Identity, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal(plaintext, &self.public_key(identity)?)
    }

    fn decrypt(&self, identity: &Identity, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open(ciphertext, self.secret(identity)?).map(|plain| plain.to_vec())
    }
}
