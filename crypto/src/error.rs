use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("no key for identity {0}")]
    UnknownIdentity(String),

    #[error("sealed payload too short: {0} bytes")]
    Truncated(usize),

    #[error("decryption failed: authentication check failed")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("randomness unavailable: {0}")]
    Random(String),
}
