//! Append-only log of completed settlements.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tollgate_types::{Address, ChannelId, HermesId, Identity, Promise, Timestamp, TokenAmount};

use crate::kv::{list_records, put_record};
use crate::{PersistentKv, StoreError};

const BUCKET: &str = "settlement_history";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementHistoryEntry {
    pub tx_hash: String,
    pub block_explorer_url: String,
    pub provider_id: Identity,
    pub hermes_id: HermesId,
    pub channel_address: ChannelId,
    pub time: Timestamp,
    pub promise: Promise,
    pub beneficiary: Address,
    pub amount: TokenAmount,
    pub total_settled: TokenAmount,
    pub fees: TokenAmount,
    pub is_withdrawal: bool,
    pub error: String,
}

impl SettlementHistoryEntry {
    /// Storage key: the transaction hash, or a synthetic key for attempts
    /// that failed before a transaction existed.
    pub fn key(&self) -> String {
        if self.tx_hash.is_empty() {
            format!(
                "failed:{}:{}:{}",
                self.channel_address,
                self.amount.raw(),
                self.time.as_secs()
            )
        } else {
            self.tx_hash.clone()
        }
    }
}

/// Narrows a history listing. `None` fields match everything.
#[derive(Clone, Debug, Default)]
pub struct HistoryFilter {
    pub time_from: Option<Timestamp>,
    pub time_to: Option<Timestamp>,
    pub provider_id: Option<Identity>,
    pub hermes_id: Option<HermesId>,
}

impl HistoryFilter {
    fn matches(&self, entry: &SettlementHistoryEntry) -> bool {
        self.time_from.map_or(true, |from| entry.time >= from)
            && self.time_to.map_or(true, |to| entry.time <= to)
            && self.provider_id.as_ref().map_or(true, |p| *p == entry.provider_id)
            && self.hermes_id.as_ref().map_or(true, |h| *h == entry.hermes_id)
    }
}

pub struct SettlementHistoryStore {
    kv: Arc<dyn PersistentKv>,
}

impl SettlementHistoryStore {
    pub fn new(kv: Arc<dyn PersistentKv>) -> Self {
        Self { kv }
    }

    /// Append an entry. Each transaction hash is recorded once.
    pub fn store(&self, entry: &SettlementHistoryEntry) -> Result<(), StoreError> {
        let key = entry.key();
        match self.kv.get_value(BUCKET, &key) {
            Ok(_) => return Err(StoreError::Duplicate(key)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        put_record(self.kv.as_ref(), BUCKET, &key, entry)
    }

    /// Matching entries, newest first.
    pub fn list(&self, filter: &HistoryFilter) -> Result<Vec<SettlementHistoryEntry>, StoreError> {
        let mut entries: Vec<SettlementHistoryEntry> = list_records(self.kv.as_ref(), BUCKET)?;
        entries.retain(|e| filter.matches(e));
        entries.sort_by(|a, b| b.time.cmp(&a.time));
        Ok(entries)
    }
}
