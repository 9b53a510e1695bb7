//! Fundamental types for the tollgate payment-settlement core.
//!
//! This crate defines the core types shared across every other crate in the workspace:
//! addresses, token amounts, promises, timestamps, and registration states.

pub mod address;
pub mod amount;
pub mod error;
pub mod hex_bytes;
pub mod promise;
pub mod state;
pub mod time;

pub use address::{Address, ChannelId, HermesId, Identity};
pub use amount::{TokenAmount, ONE_TOKEN};
pub use error::TypesError;
pub use promise::{ExchangeMessage, Promise};
pub use state::RegistrationStatus;
pub use time::Timestamp;

/// Numeric identifier of the blockchain a channel lives on.
pub type ChainId = i64;
