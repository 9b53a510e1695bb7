//! Shared utilities for tollgate.

pub mod retry;
pub mod stop;
pub mod time;

pub use retry::{Attempt, RetryError, RetryPolicy};
pub use stop::StopSignal;
pub use time::format_duration;
