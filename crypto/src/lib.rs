//! Cryptographic primitives for tollgate.
//!
//! - **Blake2b** for hashing (channel ids, hashlocks, key derivation)
//! - **X25519** + **ChaCha20-Poly1305** for sealing R-recovery payloads to an identity
//! - Deterministic channel id and channel address derivation
//! - The [`Signer`] contract and the digests it signs

pub mod channel;
pub mod encryption;
pub mod error;
pub mod hash;
pub mod hashlock;
pub mod keyring;
pub mod signing;

pub use channel::{consumer_channel_address, pay_and_settle_channel_id, provider_channel_id};
pub use encryption::{open, seal};
pub use error::CryptoError;
pub use hash::{blake2b_256, blake2b_256_multi};
pub use hashlock::{generate_r, hashlock, verify_hashlock};
pub use keyring::{identity_from_public, Encryptor, Keyring};
pub use signing::{
    beneficiary_digest, exchange_message_digest, promise_digest, refresh_digest, Signer,
};
