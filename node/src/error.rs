use thiserror::Error;
use tollgate_types::{ChainId, TokenAmount};

#[derive(Debug, Error)]
pub enum PaymentsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] tollgate_store::StoreError),

    #[error("storage backend error: {0}")]
    Lmdb(#[from] tollgate_store_lmdb::LmdbError),

    #[error("{0}")]
    Hermes(#[from] tollgate_hermes::HermesError),

    #[error("chain error: {0}")]
    Chain(#[from] tollgate_chain::ChainError),

    #[error("crypto error: {0}")]
    Crypto(#[from] tollgate_crypto::CryptoError),

    #[error("nothing to settle for provider {0}")]
    NothingToSettle(String),

    #[error("settlement was requested but not observed on chain in time")]
    SettleTimeout,

    #[error("payments core is stopped")]
    Stopped,

    #[error("provider {0} is already settling")]
    AlreadySettling(String),

    #[error("fees {fees} do not leave anything of the {unsettled} to settle")]
    FeeNotCovered {
        fees: TokenAmount,
        unsettled: TokenAmount,
    },

    #[error("fee not covered for any of the given hermeses, settled with none")]
    FeeNotCoveredForAll,

    #[error("can only withdraw from chain {allowed}, requested from {requested}")]
    WrongWithdrawalChain { requested: ChainId, allowed: ChainId },

    #[error("transactor fee {fee} exceeds the amount to withdraw {amount}")]
    WithdrawalTooSmall { fee: TokenAmount, amount: TokenAmount },

    #[error("hermes did not issue a new withdrawal promise, request again")]
    PromiseNotUpdated,

    #[error("invalid R recovery payload: {0}")]
    RecoveryPayload(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl PaymentsError {
    /// A promise store rejected a non-increasing amount.
    pub fn is_attempt_to_overwrite(&self) -> bool {
        matches!(
            self,
            Self::Store(tollgate_store::StoreError::AttemptToOverwrite { .. })
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}
