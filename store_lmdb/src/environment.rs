//! LMDB environment with one named database per bucket.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};

use tollgate_store::{PersistentKv, StoreError};

use crate::LmdbError;

type Bucket = Database<Str, Bytes>;

/// Default LMDB map size: 1 GiB.
pub const DEFAULT_MAP_SIZE: usize = 1 << 30;
/// Default maximum number of buckets (named databases).
pub const DEFAULT_MAX_BUCKETS: u32 = 64;

pub struct LmdbKv {
    env: Env,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl LmdbKv {
    /// Open or create an LMDB environment at the given directory.
    pub fn open(path: &Path, max_buckets: u32, map_size: usize) -> Result<Self, LmdbError> {
        std::fs::create_dir_all(path)?;
        // SAFETY: the environment is opened once per directory by this process
        // and never through another handle.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(max_buckets)
                .open(path)?
        };
        tracing::info!(path = %path.display(), "opened LMDB environment");
        Ok(Self {
            env,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Open with the default map size and bucket limit.
    pub fn open_default(path: &Path) -> Result<Self, LmdbError> {
        Self::open(path, DEFAULT_MAX_BUCKETS, DEFAULT_MAP_SIZE)
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle for `name`, creating the database if asked to.
    fn bucket(&self, name: &str, create: bool) -> Result<Option<Bucket>, LmdbError> {
        let mut handles = self.handles();
        if let Some(db) = handles.get(name) {
            return Ok(Some(*db));
        }

        let db = if create {
            let mut wtxn = self.env.write_txn()?;
            let db: Bucket = self.env.create_database(&mut wtxn, Some(name))?;
            wtxn.commit()?;
            Some(db)
        } else {
            let rtxn = self.env.read_txn()?;
            let db: Option<Bucket> = self.env.open_database(&rtxn, Some(name))?;
            rtxn.commit()?;
            db
        };

        if let Some(db) = db {
            handles.insert(name.to_string(), db);
        }
        Ok(db)
    }

    fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), LmdbError> {
        let db = self
            .bucket(bucket, true)?
            .ok_or_else(|| LmdbError::NotFound(bucket.to_string()))?;
        let mut wtxn = self.env.write_txn()?;
        db.put(&mut wtxn, key, value)?;
        wtxn.commit()?;
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, LmdbError> {
        let not_found = || LmdbError::NotFound(format!("{bucket}/{key}"));
        let db = self.bucket(bucket, false)?.ok_or_else(not_found)?;
        let rtxn = self.env.read_txn()?;
        let value = db.get(&rtxn, key)?.ok_or_else(not_found)?;
        Ok(value.to_vec())
    }

    fn remove(&self, bucket: &str, key: &str) -> Result<(), LmdbError> {
        let Some(db) = self.bucket(bucket, false)? else {
            return Ok(());
        };
        let mut wtxn = self.env.write_txn()?;
        db.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(())
    }

    fn entries(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>, LmdbError> {
        let Some(db) = self.bucket(bucket, false)? else {
            return Ok(Vec::new());
        };
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for item in db.iter(&rtxn)? {
            let (key, value) = item?;
            out.push((key.to_string(), value.to_vec()));
        }
        Ok(out)
    }
}

impl PersistentKv for LmdbKv {
    fn set_value(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        Ok(self.put(bucket, key, value)?)
    }

    fn get_value(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        Ok(self.get(bucket, key)?)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        Ok(self.remove(bucket, key)?)
    }

    fn list(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self.entries(bucket)?)
    }
}
