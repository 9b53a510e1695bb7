//! Sealing payloads to an X25519 public key.
//!
//! Each seal uses a fresh ephemeral X25519 key. The shared secret is
//! hashed into a ChaCha20-Poly1305 key and the nonce is derived from both
//! public keys, so the sealed payload only needs to carry the ephemeral key:
//!
//! ```text
//! ephemeral_public (32) || ciphertext || tag (16)
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::hash::blake2b_256_multi;
use crate::CryptoError;

const KEY_TAG: &[u8] = b"tollgate/r-recovery";
const PUBLIC_LEN: usize = 32;
const TAG_LEN: usize = 16;

fn cipher_for(shared: &[u8]) -> Result<ChaCha20Poly1305, CryptoError> {
    let sym_key = Zeroizing::new(blake2b_256_multi(&[shared, KEY_TAG]));
    ChaCha20Poly1305::new_from_slice(sym_key.as_slice()).map_err(|_| CryptoError::Encrypt)
}

fn nonce_for(ephemeral: &X25519Public, recipient: &X25519Public) -> [u8; 12] {
    let digest = blake2b_256_multi(&[ephemeral.as_bytes(), recipient.as_bytes()]);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    nonce
}

/// Encrypt `plaintext` so that only the holder of `recipient`'s secret can read it.
pub fn seal(plaintext: &[u8], recipient: &X25519Public) -> Result<Vec<u8>, CryptoError> {
    let mut seed = Zeroizing::new([0u8; 32]);
    getrandom::getrandom(seed.as_mut_slice()).map_err(|e| CryptoError::Random(e.to_string()))?;
    let ephemeral = StaticSecret::from(*seed);
    let ephemeral_public = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let cipher = cipher_for(shared.as_bytes())?;
    let nonce = nonce_for(&ephemeral_public, recipient);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut sealed = Vec::with_capacity(PUBLIC_LEN + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a payload produced by [`seal`].
pub fn open(sealed: &[u8], secret: &StaticSecret) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if sealed.len() < PUBLIC_LEN + TAG_LEN {
        return Err(CryptoError::Truncated(sealed.len()));
    }
    let mut ephemeral_bytes = [0u8; PUBLIC_LEN];
    ephemeral_bytes.copy_from_slice(&sealed[..PUBLIC_LEN]);
    let ephemeral_public = X25519Public::from(ephemeral_bytes);
    let recipient = X25519Public::from(secret);
    let shared = secret.diffie_hellman(&ephemeral_public);

    let cipher = cipher_for(shared.as_bytes())?;
    let nonce = nonce_for(&ephemeral_public, &recipient);
    cipher
        .decrypt(Nonce::from_slice(&nonce), &sealed[PUBLIC_LEN..])
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Decrypt)
}
