//! In-memory [`PersistentKv`] for tests and ephemeral nodes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{PersistentKv, StoreError};

type Buckets = HashMap<String, BTreeMap<String, Vec<u8>>>;

/// Thread-safe in-memory buckets.
#[derive(Default)]
pub struct MemoryKv {
    buckets: Mutex<Buckets>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn buckets(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistentKv for MemoryKv {
    fn set_value(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.buckets()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get_value(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.buckets()
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{bucket}/{key}")))
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        if let Some(b) = self.buckets().get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    fn list(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .buckets()
            .get(bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_missing_is_not_found() {
        let kv = MemoryKv::new();
        assert!(kv.get_value("b", "k").unwrap_err().is_not_found());
    }

    #[test]
    fn buckets_are_isolated() {
        let kv = MemoryKv::new();
        kv.set_value("a", "k", b"1").unwrap();
        kv.set_value("b", "k", b"2").unwrap();
        assert_eq!(kv.get_value("a", "k").unwrap(), b"1");
        assert_eq!(kv.get_value("b", "k").unwrap(), b"2");
        assert_eq!(kv.list("a").unwrap().len(), 1);
        assert!(kv.list("missing").unwrap().is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let kv = MemoryKv::new();
        kv.set_value("a", "k", b"1").unwrap();
        kv.delete("a", "k").unwrap();
        kv.delete("a", "k").unwrap();
        kv.delete("nope", "k").unwrap();
        assert!(kv.get_value("a", "k").is_err());
    }
}
