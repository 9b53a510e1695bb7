//! Running total a consumer has promised to each hermes.

use std::sync::{Arc, Mutex, PoisonError};

use tollgate_types::{ChainId, HermesId, Identity, TokenAmount};

use crate::kv::{get_record, put_record};
use crate::{PersistentKv, StoreError};

const BUCKET: &str = "consumer_promised_totals";

fn key(chain_id: ChainId, consumer: &Identity, hermes: &HermesId) -> String {
    format!("{chain_id}:{consumer}:{hermes}")
}

pub struct ConsumerTotalsStore {
    kv: Arc<dyn PersistentKv>,
    lock: Mutex<()>,
}

impl ConsumerTotalsStore {
    pub fn new(kv: Arc<dyn PersistentKv>) -> Self {
        Self {
            kv,
            lock: Mutex::new(()),
        }
    }

    pub fn get(
        &self,
        chain_id: ChainId,
        consumer: &Identity,
        hermes: &HermesId,
    ) -> Result<TokenAmount, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        get_record(self.kv.as_ref(), BUCKET, &key(chain_id, consumer, hermes))
    }

    pub fn store(
        &self,
        chain_id: ChainId,
        consumer: &Identity,
        hermes: &HermesId,
        total: TokenAmount,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        put_record(self.kv.as_ref(), BUCKET, &key(chain_id, consumer, hermes), &total)
    }

    /// Add to the stored total, starting from zero. Returns the new total.
    pub fn add(
        &self,
        chain_id: ChainId,
        consumer: &Identity,
        hermes: &HermesId,
        amount: TokenAmount,
    ) -> Result<TokenAmount, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let key = key(chain_id, consumer, hermes);
        let current = match get_record::<TokenAmount>(self.kv.as_ref(), BUCKET, &key) {
            Ok(total) => total,
            Err(e) if e.is_not_found() => TokenAmount::ZERO,
            Err(e) => return Err(e),
        };
        let total = current.saturating_add(amount);
        put_record(self.kv.as_ref(), BUCKET, &key, &total)?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;

    #[test]
    fn add_accumulates_from_zero() {
        let store = ConsumerTotalsStore::new(Arc::new(MemoryKv::new()));
        let id = Identity::new("0xa1");
        let hermes = HermesId::new("0xb2");

        assert!(store.get(1, &id, &hermes).unwrap_err().is_not_found());
        assert_eq!(store.add(1, &id, &hermes, TokenAmount::new(5)).unwrap(), TokenAmount::new(5));
        assert_eq!(store.add(1, &id, &hermes, TokenAmount::new(7)).unwrap(), TokenAmount::new(12));
        assert_eq!(store.get(1, &id, &hermes).unwrap(), TokenAmount::new(12));
        assert!(store.get(2, &id, &hermes).is_err());
    }

    #[test]
    fn store_overwrites() {
        let store = ConsumerTotalsStore::new(Arc::new(MemoryKv::new()));
        let id = Identity::new("0xa1");
        let hermes = HermesId::new("0xb2");
        store.store(1, &id, &hermes, TokenAmount::new(50)).unwrap();
        store.store(1, &id, &hermes, TokenAmount::new(40)).unwrap();
        assert_eq!(store.get(1, &id, &hermes).unwrap(), TokenAmount::new(40));
    }
}
