//! Persistence for tollgate.
//!
//! Every storage backend (LMDB, in-memory for testing) implements the
//! bucket-keyed [`PersistentKv`] trait. The record stores in this crate
//! (promises, settlement history, consumer totals) depend only on the trait.

pub mod consumer_totals;
pub mod error;
pub mod kv;
pub mod memory;
pub mod promise;
pub mod settlement_history;

pub use consumer_totals::ConsumerTotalsStore;
pub use error::StoreError;
pub use kv::PersistentKv;
pub use memory::MemoryKv;
pub use promise::{HermesPromise, PromiseFilter, PromiseStore};
pub use settlement_history::{HistoryFilter, SettlementHistoryEntry, SettlementHistoryStore};
