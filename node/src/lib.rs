//! tollgate payment core.
//!
//! The settlement side of a bandwidth-sharing node:
//! - Exchanges consumer payment messages for hermes promises and reveals R
//! - Caches provider channels and publishes earnings changes
//! - Tracks consumer balances against chain state and hermes
//! - Settles provider earnings on chain once they cross a threshold
//!
//! Components talk over an in-process [`EventBus`]; [`PaymentsCore`] wires
//! them together.

pub mod balance;
pub mod balance_tracker;
pub mod channel;
pub mod channel_repository;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod logging;
pub mod metrics;
pub mod payments;
pub mod promise_handler;
pub mod settler;

pub use balance::ConsumerBalance;
pub use balance_tracker::{BalanceSyncConfig, BalanceTracker};
pub use channel::{Channel, Earnings, EarningsDetailed};
pub use channel_repository::ChannelRepository;
pub use config::PaymentsConfig;
pub use error::PaymentsError;
pub use events::{AppEvent, EventBus, NodeStatus, Topic};
pub use job::{Job, JobSyncer};
pub use logging::{init_logging, LogFormat};
pub use metrics::PaymentsMetrics;
pub use payments::{hermes_resolver, open_store, Collaborators, PaymentsCore};
pub use promise_handler::{PromiseHandler, PromiseRequest, RequestHandle, RequestKind};
pub use settler::{explorer_url, SettlementKind, SettlementScheduler, SettlementState, SettlerConfig};
