//! Idempotent keyed row storage.
//!
//! The store is the long-term home of every record. Inserts are
//! insert-if-absent: the first writer of an id wins and later writes of the
//! same id report zero rows affected, which is what makes flush retries and
//! concurrent fallback drains safe.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::RowId;

/// A persisted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: RowId,
    /// Encoded [`crate::protocol::Record`].
    pub payload: String,
}

/// Store errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// Backend failure other than reachability.
    #[error("database error: {0}")]
    Database(String),
    /// A stored value could not be decoded.
    #[error("store codec error: {0}")]
    Codec(String),
}

/// The persistent store seam.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert unless `id` exists. Returns rows affected: 1 inserted, 0 duplicate.
    async fn insert_if_absent(&self, id: RowId, payload: &str) -> Result<u64, StoreError>;

    /// Every row, ascending by id.
    async fn scan_all(&self) -> Result<Vec<StoredRow>, StoreError>;

    /// Reachability probe without side effects.
    async fn ping(&self) -> bool;
}

/// In-process store with a reachability switch modelling the database link.
#[derive(Debug)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<RowId, String>>,
    reachable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a row with this id exists, regardless of reachability.
    pub fn contains(&self, id: &RowId) -> bool {
        self.lock().contains_key(id)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RowId, String>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(StoreError::StoreUnavailable("memory store offline".into()))
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_if_absent(&self, id: RowId, payload: &str) -> Result<u64, StoreError> {
        self.check_reachable()?;
        let mut rows = self.lock();
        if rows.contains_key(&id) {
            return Ok(0);
        }
        rows.insert(id, payload.to_string());
        Ok(1)
    }

    async fn scan_all(&self) -> Result<Vec<StoredRow>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .lock()
            .iter()
            .map(|(id, payload)| StoredRow {
                id: *id,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn ping(&self) -> bool {
        self.is_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_if_absent_is_idempotent() {
        let store = MemoryStore::new();
        assert_eq!(store.insert_if_absent(RowId::Log(1), "first").await.unwrap(), 1);
        assert_eq!(store.insert_if_absent(RowId::Log(1), "second").await.unwrap(), 0);

        let rows = store.scan_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload, "first");
    }

    #[tokio::test]
    async fn test_scan_is_ordered() {
        let store = MemoryStore::new();
        let oob = RowId::out_of_band();
        store.insert_if_absent(oob, "c").await.unwrap();
        store.insert_if_absent(RowId::Log(9), "b").await.unwrap();
        store.insert_if_absent(RowId::Log(2), "a").await.unwrap();

        let ids: Vec<RowId> = store.scan_all().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![RowId::Log(2), RowId::Log(9), oob]);
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        assert!(!store.ping().await);
        assert!(matches!(
            store.insert_if_absent(RowId::Log(1), "x").await,
            Err(StoreError::StoreUnavailable(_))
        ));
        assert!(store.scan_all().await.is_err());
        assert!(!store.contains(&RowId::Log(1)));
    }
}
