//! Process-local buffer for records that could reach neither the log nor the store.
//!
//! Entries only ever leave the buffer by being moved into the store. A drain
//! works on a copy taken before the first store call, and clears exactly the
//! copied keys once every insert has been confirmed. Entries added while the
//! drain is in flight stay behind for the next one.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::store::RecordStore;
use super::RowId;

/// Outcome of [`FallbackBuffer::drain_and_persist`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainReport {
    /// Nothing to drain.
    Empty,
    /// Every snapshotted entry is in the store and was removed from the buffer.
    Success {
        rows_inserted: u64,
        num_remaining: usize,
    },
    /// At least one insert failed; the buffer is unchanged.
    Failed { rows_failed: u64 },
}

/// Transient map of out-of-band records keyed by row id.
#[derive(Debug, Default)]
pub struct FallbackBuffer {
    entries: Mutex<HashMap<RowId, String>>,
}

impl FallbackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any entry with the same id.
    pub fn add(&self, id: RowId, payload: impl Into<String>) {
        self.lock().insert(id, payload.into());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current entries.
    pub fn values(&self) -> Vec<(RowId, String)> {
        self.lock()
            .iter()
            .map(|(id, payload)| (*id, payload.clone()))
            .collect()
    }

    pub fn contains(&self, id: &RowId) -> bool {
        self.lock().contains_key(id)
    }

    /// Move the buffered entries into `store`, all or nothing.
    pub async fn drain_and_persist(&self, store: &dyn RecordStore) -> DrainReport {
        let snapshot = self.values();
        if snapshot.is_empty() {
            return DrainReport::Empty;
        }

        let outcomes = join_all(
            snapshot
                .iter()
                .map(|(id, payload)| store.insert_if_absent(*id, payload)),
        )
        .await;

        let mut rows_inserted = 0u64;
        let mut rows_failed = 0u64;
        for (outcome, (id, _)) in outcomes.iter().zip(&snapshot) {
            match outcome {
                Ok(affected) => rows_inserted += affected,
                Err(e) => {
                    log::warn!("Fallback entry {id} not persisted: {e}");
                    rows_failed += 1;
                }
            }
        }

        if rows_failed > 0 {
            return DrainReport::Failed { rows_failed };
        }

        let mut entries = self.lock();
        for (id, _) in &snapshot {
            entries.remove(id);
        }
        DrainReport::Success {
            rows_inserted,
            num_remaining: entries.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RowId, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::{MemoryStore, StoreError, StoredRow};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Store that rejects one specific id.
    struct RejectingStore {
        inner: MemoryStore,
        reject: RowId,
    }

    #[async_trait]
    impl RecordStore for RejectingStore {
        async fn insert_if_absent(&self, id: RowId, payload: &str) -> Result<u64, StoreError> {
            if id == self.reject {
                return Err(StoreError::StoreUnavailable("rejected".into()));
            }
            self.inner.insert_if_absent(id, payload).await
        }

        async fn scan_all(&self) -> Result<Vec<StoredRow>, StoreError> {
            self.inner.scan_all().await
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    /// Store that adds to the buffer while an insert is in flight.
    struct InterleavingStore {
        inner: MemoryStore,
        buffer: Arc<FallbackBuffer>,
        late: RowId,
    }

    #[async_trait]
    impl RecordStore for InterleavingStore {
        async fn insert_if_absent(&self, id: RowId, payload: &str) -> Result<u64, StoreError> {
            self.buffer.add(self.late, "late");
            self.inner.insert_if_absent(id, payload).await
        }

        async fn scan_all(&self) -> Result<Vec<StoredRow>, StoreError> {
            self.inner.scan_all().await
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_drain_empty_is_noop() {
        let buffer = FallbackBuffer::new();
        let store = MemoryStore::new();
        assert_eq!(buffer.drain_and_persist(&store).await, DrainReport::Empty);
    }

    #[tokio::test]
    async fn test_drain_moves_entries() {
        let buffer = FallbackBuffer::new();
        let store = MemoryStore::new();
        for i in 0..3 {
            buffer.add(RowId::out_of_band(), format!("r{i}"));
        }

        let report = buffer.drain_and_persist(&store).await;
        assert_eq!(
            report,
            DrainReport::Success {
                rows_inserted: 3,
                num_remaining: 0
            }
        );
        assert!(buffer.is_empty());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_add_overwrites_by_id() {
        let buffer = FallbackBuffer::new();
        let id = RowId::out_of_band();
        buffer.add(id, "old");
        buffer.add(id, "new");
        assert_eq!(buffer.values(), vec![(id, "new".to_string())]);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_everything() {
        let buffer = FallbackBuffer::new();
        let ids: Vec<RowId> = (0..4).map(|_| RowId::out_of_band()).collect();
        for (i, id) in ids.iter().enumerate() {
            buffer.add(*id, format!("r{i}"));
        }
        let before = {
            let mut v = buffer.values();
            v.sort();
            v
        };

        let flaky = RejectingStore {
            inner: MemoryStore::new(),
            reject: ids[2],
        };
        let report = buffer.drain_and_persist(&flaky).await;
        assert_eq!(report, DrainReport::Failed { rows_failed: 1 });

        let mut after = buffer.values();
        after.sort();
        assert_eq!(after, before);

        // Retry against a healthy store: the already-inserted rows are
        // duplicates, the rest go in, and the buffer empties.
        let report = buffer.drain_and_persist(&flaky.inner).await;
        assert_eq!(
            report,
            DrainReport::Success {
                rows_inserted: 1,
                num_remaining: 0
            }
        );
        assert!(buffer.is_empty());
        assert_eq!(flaky.inner.len(), 4);
    }

    #[tokio::test]
    async fn test_entries_added_during_drain_survive() {
        let buffer = Arc::new(FallbackBuffer::new());
        let early = RowId::out_of_band();
        let late = RowId::out_of_band();
        buffer.add(early, "early");

        let store = InterleavingStore {
            inner: MemoryStore::new(),
            buffer: buffer.clone(),
            late,
        };
        let report = buffer.drain_and_persist(&store).await;
        assert_eq!(
            report,
            DrainReport::Success {
                rows_inserted: 1,
                num_remaining: 1
            }
        );
        assert!(!buffer.contains(&early));
        assert!(buffer.contains(&late));
        assert!(!store.inner.contains(&late));
    }
}
