//! Errors raised while parsing or validating core types.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypesError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("unknown registration status: {0}")]
    UnknownRegistrationStatus(String),
}
