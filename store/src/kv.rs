//! Bucket-keyed persistence interface.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::StoreError;

/// A key-value store partitioned into named buckets.
///
/// `get_value` reports a missing key as [`StoreError::NotFound`].
pub trait PersistentKv: Send + Sync {
    fn set_value(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn get_value(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;
    /// Removing a missing key is not an error.
    fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
    /// All entries of a bucket in key order. A missing bucket is empty.
    fn list(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// Serialize `value` with bincode and store it.
pub fn put_record<T: Serialize>(
    kv: &dyn PersistentKv,
    bucket: &str,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    kv.set_value(bucket, key, &bytes)
}

/// Load and deserialize a record stored with [`put_record`].
pub fn get_record<T: DeserializeOwned>(
    kv: &dyn PersistentKv,
    bucket: &str,
    key: &str,
) -> Result<T, StoreError> {
    let bytes = kv.get_value(bucket, key)?;
    decode(&bytes)
}

/// Every record of a bucket.
pub fn list_records<T: DeserializeOwned>(
    kv: &dyn PersistentKv,
    bucket: &str,
) -> Result<Vec<T>, StoreError> {
    kv.list(bucket)?
        .into_iter()
        .map(|(_, bytes)| decode(&bytes))
        .collect()
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}
