use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The channel has not been opened on chain yet.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("blockchain RPC error: {0}")]
    Rpc(String),

    #[error("transactor error: {0}")]
    Transactor(String),

    /// The transactor answered with a non-success HTTP status.
    #[error("transactor returned {status}: {message}")]
    TransactorStatus { status: u16, message: String },

    #[error("registry error: {0}")]
    Registry(String),
}

impl ChainError {
    /// Conflicts and server-side failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransactorStatus { status, .. } => *status == 409 || *status >= 500,
            _ => false,
        }
    }
}
