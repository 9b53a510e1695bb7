//! Hermes error taxonomy.
//!
//! Hermes reports failures as `{cause, message, data}` bodies. The `cause`
//! string is matched against a fixed table; some causes drive recovery
//! (R recovery, retry on rate limiting) rather than being surfaced.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HermesCause {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("internal error")]
    Internal,
    #[error("previous R not revealed")]
    PreviousRNotRevealed,
    #[error("payment value too low")]
    PaymentValueTooLow,
    #[error("provider balance exhausted, please rebalance your channel")]
    ProviderBalanceExhausted,
    #[error("promise value too low")]
    PromiseValueTooLow,
    #[error("consumer does not have enough balance and is overspending")]
    Overspend,
    #[error("malformed json")]
    MalformedJson,
    #[error("r recovery required")]
    NeedsRRecovery,
    #[error("invalid previous latest promise, impossible to issue new one")]
    InvalidPreviousLatestPromise,
    #[error("no previous promise found")]
    NoPreviousPromise,
    #[error("hashlock mismatch")]
    HashlockMismatch,
    #[error("resource not found")]
    NotFound,
    #[error("too many simultaneous requests")]
    TooManyRequests,
    #[error("consumer unregistered")]
    ConsumerUnregistered,
}

impl HermesCause {
    /// Match the `cause` field of a hermes error body.
    pub fn from_wire(cause: &str) -> Option<Self> {
        let cause = match cause {
            "invalid signature" => Self::InvalidSignature,
            "internal error" => Self::Internal,
            "previous R not revealed" => Self::PreviousRNotRevealed,
            "payment value too low" => Self::PaymentValueTooLow,
            "provider balance exhausted, please rebalance your channel" => {
                Self::ProviderBalanceExhausted
            }
            "promise value too low" => Self::PromiseValueTooLow,
            "consumer does not have enough balance and is overspending" => Self::Overspend,
            "malformed json" => Self::MalformedJson,
            "r recovery required" => Self::NeedsRRecovery,
            // Hermes spells these two causes this way on the wire.
            "invalid previuos latest promise, impossible to issue new one" => {
                Self::InvalidPreviousLatestPromise
            }
            "hashlock missmatch" => Self::HashlockMismatch,
            "no previous promise found" => Self::NoPreviousPromise,
            "resource not found" => Self::NotFound,
            "too many simultaneous requests" => Self::TooManyRequests,
            "consumer unregistered" => Self::ConsumerUnregistered,
            _ => return None,
        };
        Some(cause)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HermesError {
    #[error("hermes error ({cause}): {message}")]
    Remote {
        cause: HermesCause,
        message: String,
        data: String,
    },

    #[error("unknown hermes error cause {cause:?}: {message}")]
    UnknownCause { cause: String, message: String },

    #[error("hermes returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("hermes request failed: {0}")]
    Transport(String),

    #[error("invalid hermes response: {0}")]
    Decode(String),

    #[error("no hermes configured for {0}")]
    UnknownHermes(String),
}

impl HermesError {
    pub fn remote(cause: HermesCause, message: impl Into<String>) -> Self {
        Self::Remote {
            cause,
            message: message.into(),
            data: String::new(),
        }
    }

    /// The classified cause, if hermes sent a known one.
    pub fn cause(&self) -> Option<HermesCause> {
        match self {
            Self::Remote { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    pub fn is(&self, cause: HermesCause) -> bool {
        self.cause() == Some(cause)
    }

    /// Extra payload attached by hermes (the encrypted R for recovery).
    pub fn data(&self) -> Option<&str> {
        match self {
            Self::Remote { data, .. } if !data.is_empty() => Some(data),
            _ => None,
        }
    }

    /// Whether hermes answered with an error of its own, as opposed to the
    /// request failing in transit.
    pub fn is_classified(&self) -> bool {
        matches!(self, Self::Remote { .. } | Self::UnknownCause { .. })
    }
}

/// Error body as hermes sends it.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: String,
}

impl ErrorBody {
    pub(crate) fn into_error(self) -> HermesError {
        match HermesCause::from_wire(&self.cause) {
            Some(cause) => HermesError::Remote {
                cause,
                message: self.message,
                data: self.data,
            },
            None => HermesError::UnknownCause {
                cause: self.cause,
                message: self.message,
            },
        }
    }
}
