//! Durable blob storage behind the opportunity store. The production
//! implementation keeps blobs in a single redb table keyed by path, which
//! gives prefix listing via an ordered range scan; tests use the in-memory
//! implementation.

use parking_lot::Mutex;
use redb::{ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const BLOBS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("blobs");

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redb error: {0}")]
    Redb(#[from] redb::Error),
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Blob not found: {0}")]
    NotFound(String),
    #[error("Artifact rejected: {0}")]
    Rejected(String),
}

/// Storage seam for scan artifacts. Paths are slash-separated keys like
/// `opportunities/2026-08-03/14-30.json`; `list_prefix` returns matching
/// paths in ascending lexicographic order.
pub trait BlobStore: Send + Sync {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn get(&self, path: &str) -> Result<Vec<u8>, StoreError>;
    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

pub struct RedbBlobStore {
    db: redb::Database,
}

impl RedbBlobStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = redb::Database::create(path)?;
        // Make sure the table exists so first list/get doesn't error
        let txn = db.begin_write()?;
        txn.open_table(BLOBS_TABLE)?;
        txn.commit()?;
        Ok(Self { db })
    }
}

impl BlobStore for RedbBlobStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(BLOBS_TABLE)?;
            table.insert(path, bytes.to_vec())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BLOBS_TABLE)?;
        let value = table
            .get(path)?
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        Ok(value.value())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BLOBS_TABLE)?;
        let mut paths = Vec::new();
        for entry in table.range::<&str>(prefix..)? {
            let (key, _) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            paths.push(key.to_string());
        }
        Ok(paths)
    }
}

/// Test double: a BTreeMap behind a mutex, same ordering semantics as the
/// redb table. Also usable to inject write failures.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: Mutex<bool>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if *self.fail_writes.lock() {
            return Err(StoreError::Rejected("simulated write failure".to_string()));
        }
        self.blobs.lock().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .blobs
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(store: &dyn BlobStore) {
        store.put("opportunities/2026-08-03/14-30.json", b"a").unwrap();
        store.put("opportunities/2026-08-03/15-30.json", b"b").unwrap();
        store.put("opportunities/2026-08-04/09-30.json", b"c").unwrap();

        assert_eq!(store.get("opportunities/2026-08-03/14-30.json").unwrap(), b"a");
        assert!(matches!(
            store.get("opportunities/2026-08-03/10-30.json"),
            Err(StoreError::NotFound(_))
        ));

        let day = store.list_prefix("opportunities/2026-08-03/").unwrap();
        assert_eq!(
            day,
            vec![
                "opportunities/2026-08-03/14-30.json",
                "opportunities/2026-08-03/15-30.json",
            ]
        );
    }

    #[test]
    fn test_memory_store_roundtrip() {
        roundtrip(&MemoryBlobStore::new());
    }

    #[test]
    fn test_redb_store_roundtrip() {
        let path = format!("/tmp/test_blobs_{}.redb", uuid::Uuid::new_v4());
        roundtrip(&RedbBlobStore::new(&path).expect("create store"));
        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_put_overwrites() {
        let store = MemoryBlobStore::new();
        store.put("k", b"v1").unwrap();
        store.put("k", b"v2").unwrap();
        assert_eq!(store.get("k").unwrap(), b"v2");
    }
}
