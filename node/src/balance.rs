//! Consumer balance cache entries.

use std::time::Duration;

use tollgate_types::{Timestamp, TokenAmount};

/// What the node knows about a consumer's spendable balance on one chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerBalance {
    pub bc_balance: TokenAmount,
    pub bc_settled: TokenAmount,
    pub grand_total_promised: TokenAmount,
    /// Balance figures come from hermes, not from the chain.
    pub is_offchain: bool,
    pub last_offchain_sync: Timestamp,
}

impl ConsumerBalance {
    /// Balance minus what was promised beyond the settled amount, never below zero.
    pub fn get_balance(&self) -> TokenAmount {
        let outstanding = self.grand_total_promised.saturating_sub(self.bc_settled);
        self.bc_balance.saturating_sub(outstanding)
    }

    /// An off-chain entry that was not synced with hermes within `expiration`.
    pub fn is_stale(&self, expiration: Duration, now: Timestamp) -> bool {
        self.is_offchain && self.last_offchain_sync.has_expired(expiration, now)
    }
}
