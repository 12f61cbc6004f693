//! Key-value port
//!
//! All persistent state outside of image objects is a flat namespace of
//! string keys mapped to string scalars. Callers depend on the `KvStore`
//! trait so the metrics, token and redirect logic runs unchanged against the
//! redb table or the in-memory map used in tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::RwLock;

use crate::database::TABLE_KV;
use crate::error::KvError;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Last write wins
    async fn put(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Every `(key, value)` whose key starts with `prefix`, in key order
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, KvError>;
}

/// `KvStore` backed by the `kv_v1` redb table
#[derive(Clone)]
pub struct RedbKv {
    db: Arc<Database>,
}

impl RedbKv {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn read(&self, key: &str) -> Result<Option<String>, redb::Error> {
        // Read transactions see a consistent snapshot and never block writers
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_KV)?;
        let value = table.get(key)?.map(|guard| guard.value().to_string());
        Ok(value)
    }

    /// Inserts `value`, or removes `key` when `value` is `None`
    fn write(&self, key: &str, value: Option<&str>) -> Result<(), redb::Error> {
        let write_txn = self.db.begin_write()?;

        // Scope the table so its borrow of the transaction ends before commit
        {
            let mut table = write_txn.open_table(TABLE_KV)?;
            match value {
                Some(value) => {
                    table.insert(key, value)?;
                }
                None => {
                    table.remove(key)?;
                }
            }
        }
        // Commit the transaction to persist changes
        write_txn.commit()?;
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, redb::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_KV)?;

        // Keys are ordered, so the prefix block is contiguous from `prefix`.
        let mut entries = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_string(), value.value().to_string()));
        }
        Ok(entries)
    }
}

#[async_trait]
impl KvStore for RedbKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.read(key)?)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        Ok(self.write(key, Some(value))?)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        Ok(self.write(key, None)?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, KvError> {
        Ok(self.scan(prefix)?)
    }
}

/// In-memory `KvStore`
///
/// Writes can be switched to fail, which lets tests exercise the fail-open
/// paths of metrics recording.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), KvError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.check_writable()?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.check_writable()?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, KvError> {
        // Same ordered range walk as the redb scan
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
