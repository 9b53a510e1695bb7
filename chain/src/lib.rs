//! Contracts the payment core requires from the blockchain and the
//! transactor service.
//!
//! Only the interfaces live here. Implementations are supplied by the node
//! embedding the core; `tollgate-nullables` provides scripted ones for tests.

pub mod error;
pub mod subscription;
pub mod traits;
pub mod types;

pub use error::ChainError;
pub use subscription::Subscription;
pub use traits::{BlockchainView, RegistrationStatusProvider, Transactor};
pub use types::{
    ConsumerChannel, FeesResponse, PromiseSettledEvent, ProviderChannel, TokenTransfer,
    TransactorRegistration, TransactorRegistrationState,
};
