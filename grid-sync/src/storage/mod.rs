//! Durable state behind the sync server.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   append / tail   ┌──────────────┐
//! │ SyncServer  │ ────────────────► │ DurableLog   │  ids 1, 2, 3, ...
//! │ (sessions)  │                   │ (Memory/Rocks)│
//! └──────┬──────┘                   └──────┬───────┘
//!        │                                 │ flush cycle
//!        │ store unreachable               ▼
//!        ▼                          ┌──────────────┐
//! ┌─────────────┐   drain           │ RecordStore  │  insert-if-absent
//! │ Fallback    │ ────────────────► │ (Memory/Rocks)│
//! │ Buffer      │                   └──────────────┘
//! └─────────────┘
//! ```
//!
//! Rows are keyed by [`RowId`]. Rows that travelled through the log keep the
//! log id; records written around the log get a time-ordered out-of-band id.

pub mod edit_log;
pub mod fallback;
pub mod rocks;
pub mod store;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub use edit_log::{DurableLog, LogEntry, LogError, MemoryLog};
pub use fallback::{DrainReport, FallbackBuffer};
pub use rocks::{RocksConfig, RocksLog, RocksStore};
pub use store::{MemoryStore, RecordStore, StoreError, StoredRow};

const KEY_TAG_LOG: u8 = 0x00;
const KEY_TAG_OUT_OF_BAND: u8 = 0x01;

/// Identity of a persisted row.
///
/// Ordering: every `Log` id ascending, then `OutOfBand` ids in creation order
/// (UUIDv7 sorts by timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowId {
    /// Id assigned by the durable log.
    Log(u64),
    /// Record written directly to the store or the fallback buffer.
    OutOfBand(Uuid),
}

impl RowId {
    /// Fresh out-of-band id.
    pub fn out_of_band() -> Self {
        RowId::OutOfBand(Uuid::now_v7())
    }

    pub fn log_id(&self) -> Option<u64> {
        match self {
            RowId::Log(id) => Some(*id),
            RowId::OutOfBand(_) => None,
        }
    }

    pub fn is_out_of_band(&self) -> bool {
        matches!(self, RowId::OutOfBand(_))
    }

    /// Storage key whose byte order matches `Ord`.
    pub fn to_key(&self) -> Vec<u8> {
        match self {
            RowId::Log(id) => {
                let mut key = Vec::with_capacity(9);
                key.push(KEY_TAG_LOG);
                key.extend_from_slice(&id.to_be_bytes());
                key
            }
            RowId::OutOfBand(uuid) => {
                let mut key = Vec::with_capacity(17);
                key.push(KEY_TAG_OUT_OF_BAND);
                key.extend_from_slice(uuid.as_bytes());
                key
            }
        }
    }

    /// Inverse of [`RowId::to_key`].
    pub fn from_key(key: &[u8]) -> Option<Self> {
        match key.split_first()? {
            (&KEY_TAG_LOG, rest) => {
                let bytes: [u8; 8] = rest.try_into().ok()?;
                Some(RowId::Log(u64::from_be_bytes(bytes)))
            }
            (&KEY_TAG_OUT_OF_BAND, rest) => {
                let bytes: [u8; 16] = rest.try_into().ok()?;
                Some(RowId::OutOfBand(Uuid::from_bytes(bytes)))
            }
            _ => None,
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowId::Log(id) => write!(f, "{id}"),
            RowId::OutOfBand(uuid) => write!(f, "oob-{uuid}"),
        }
    }
}
