//! Nullable collaborators for deterministic testing.
//!
//! Every external service the payment core talks to (hermes, the blockchain,
//! the transactor, the identity registry, the signer) sits behind a trait. The types here
//! implement those traits in memory:
//! - responses are scripted up front or fall back to a sensible default
//! - every call is recorded so tests can assert on it
//! - nothing touches the network
//!
//! Usage: hand them to the core in place of the real clients.

pub mod chain;
pub mod hermes;
pub mod registry;
pub mod signer;
pub mod transactor;

pub use chain::NullBlockchain;
pub use hermes::{promise_signature, NullHermes, NullHermesResolver, RevealCall, SyncCall};
pub use registry::NullRegistry;
pub use signer::NullSigner;
pub use transactor::{NullTransactor, SettleCall, SettleKind};
