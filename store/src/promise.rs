//! Latest hermes promise per provider channel.
//!
//! One record per channel, in a bucket per chain. The stored amount only
//! ever grows: storing a promise that does not exceed the stored one is
//! rejected with [`StoreError::AttemptToOverwrite`] and leaves the record
//! untouched.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tollgate_crypto::provider_channel_id;
use tollgate_types::{ChainId, ChannelId, HermesId, Identity, Promise};

use crate::kv::{get_record, list_records, put_record};
use crate::{PersistentKv, StoreError};

/// A promise received from hermes together with the secret that unlocks it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HermesPromise {
    pub channel_id: ChannelId,
    pub identity: Identity,
    pub hermes_id: HermesId,
    pub promise: Promise,
    /// Hex-encoded R.
    pub r: String,
    /// Whether R has been disclosed to hermes.
    pub revealed: bool,
    pub agreement_id: u128,
}

/// Selects promises on one chain. Empty lists match everything.
#[derive(Clone, Debug, Default)]
pub struct PromiseFilter {
    pub chain_id: ChainId,
    pub identities: Vec<Identity>,
    pub hermes_ids: Vec<HermesId>,
}

impl PromiseFilter {
    pub fn chain(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            ..Default::default()
        }
    }

    fn matches(&self, promise: &HermesPromise) -> bool {
        (self.identities.is_empty() || self.identities.contains(&promise.identity))
            && (self.hermes_ids.is_empty() || self.hermes_ids.contains(&promise.hermes_id))
    }
}

fn bucket(chain_id: ChainId) -> String {
    format!("hermes_promises_{chain_id}")
}

pub struct PromiseStore {
    kv: Arc<dyn PersistentKv>,
    lock: Mutex<()>,
}

impl PromiseStore {
    pub fn new(kv: Arc<dyn PersistentKv>) -> Self {
        Self {
            kv,
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist `promise` if its amount exceeds the stored one for the channel.
    pub fn store(&self, promise: &HermesPromise) -> Result<(), StoreError> {
        let _guard = self.guard();
        let bucket = bucket(promise.promise.chain_id);
        let key = promise.channel_id.as_str();

        match get_record::<HermesPromise>(self.kv.as_ref(), &bucket, key) {
            Ok(previous) if previous.promise.amount >= promise.promise.amount => {
                return Err(StoreError::AttemptToOverwrite {
                    channel: key.to_string(),
                    stored: previous.promise.amount.raw(),
                    attempted: promise.promise.amount.raw(),
                });
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        put_record(self.kv.as_ref(), &bucket, key, promise)?;
        tracing::debug!(
            channel = %key,
            amount = %promise.promise.amount,
            "stored hermes promise"
        );
        Ok(())
    }

    pub fn get(&self, chain_id: ChainId, channel_id: &ChannelId) -> Result<HermesPromise, StoreError> {
        let _guard = self.guard();
        get_record(self.kv.as_ref(), &bucket(chain_id), channel_id.as_str())
    }

    /// The promise for the channel between `identity` and `hermes`.
    pub fn get_for(
        &self,
        chain_id: ChainId,
        identity: &Identity,
        hermes: &HermesId,
    ) -> Result<HermesPromise, StoreError> {
        self.get(chain_id, &provider_channel_id(identity, hermes))
    }

    /// Record that `r` was disclosed to hermes.
    ///
    /// Only flips the flag when `r` is the R of the stored promise; a reveal
    /// for a record that has since been replaced leaves it untouched and
    /// returns `false`.
    pub fn mark_revealed(
        &self,
        chain_id: ChainId,
        channel_id: &ChannelId,
        r: &str,
    ) -> Result<bool, StoreError> {
        let _guard = self.guard();
        let bucket = bucket(chain_id);
        let mut promise: HermesPromise =
            get_record(self.kv.as_ref(), &bucket, channel_id.as_str())?;
        if !promise.r.eq_ignore_ascii_case(r) {
            return Ok(false);
        }
        if !promise.revealed {
            promise.revealed = true;
            put_record(self.kv.as_ref(), &bucket, channel_id.as_str(), &promise)?;
        }
        Ok(true)
    }

    pub fn list(&self, filter: &PromiseFilter) -> Result<Vec<HermesPromise>, StoreError> {
        let _guard = self.guard();
        let all: Vec<HermesPromise> = list_records(self.kv.as_ref(), &bucket(filter.chain_id))?;
        Ok(all.into_iter().filter(|p| filter.matches(p)).collect())
    }

    /// Drop the stored promise for a channel. Administrative cleanup only.
    pub fn delete(&self, chain_id: ChainId, channel_id: &ChannelId) -> Result<(), StoreError> {
        let _guard = self.guard();
        self.kv.delete(&bucket(chain_id), channel_id.as_str())
    }
}
