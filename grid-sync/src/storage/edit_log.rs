//! Durable, ordered, append-only edit log with blocking tail reads.
//!
//! ```text
//!   append ──► [ 1 | 2 | 3 | 4 | 5 | 6 ] ◄── read_blocking(cursor = 4) → [5, 6]
//!                ▲                 ▲
//!                trim(keep = 2, persisted_through = 4) removes 1..=3 at most
//! ```
//!
//! Ids start at 1, grow by one per append and are never reused, even after a
//! trim. Blocked readers are woken through a `watch` channel carrying the tip.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use crate::protocol::Record;

/// One entry of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: u64,
    /// Encoded [`Record`].
    pub payload: String,
}

impl LogEntry {
    pub fn new(id: u64, payload: impl Into<String>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// Decode the carried record.
    pub fn record(&self) -> Result<Record, crate::protocol::ProtocolError> {
        Record::decode(&self.payload)
    }
}

/// On-disk envelope of a log entry, with an integrity checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEntry {
    pub id: u64,
    pub payload: String,
    pub checksum: u32,
}

impl SealedEntry {
    pub fn seal(entry: &LogEntry) -> Self {
        Self {
            id: entry.id,
            payload: entry.payload.clone(),
            checksum: Self::compute_checksum(entry.id, &entry.payload),
        }
    }

    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.id, &self.payload)
    }

    pub fn into_entry(self) -> LogEntry {
        LogEntry {
            id: self.id,
            payload: self.payload,
        }
    }

    /// FNV-1a over the id and payload.
    fn compute_checksum(id: u64, payload: &str) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in id.to_le_bytes().iter().chain(payload.as_bytes()) {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }

    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| LogError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        let (entry, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| LogError::Codec(e.to_string()))?;
        Ok(entry)
    }
}

/// Log errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LogError {
    /// The log transport cannot be reached.
    #[error("log transport unavailable: {0}")]
    TransportUnavailable(String),
    /// An entry could not be encoded or decoded.
    #[error("log codec error: {0}")]
    Codec(String),
}

/// The durable log seam.
///
/// `read_blocking` must be cancel-safe: dropping the future before it
/// resolves leaves the log untouched.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append a record, returning the id assigned to it.
    async fn append(&self, record: &Record) -> Result<u64, LogError>;

    /// Entries with `id > cursor`, oldest first.
    ///
    /// Waits until at least one exists. `None` waits indefinitely; on
    /// timeout an empty batch is returned.
    async fn read_blocking(
        &self,
        cursor: u64,
        timeout: Option<Duration>,
    ) -> Result<Vec<LogEntry>, LogError>;

    /// Entries with `from <= id <= to`, oldest first.
    async fn range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, LogError>;

    /// Drop old entries, keeping at least `keep_at_least` of the newest and
    /// every entry with `id > persisted_through`. Returns how many were removed.
    async fn trim(&self, keep_at_least: usize, persisted_through: u64) -> Result<u64, LogError>;

    /// Id of the newest entry ever appended, 0 for an empty log.
    async fn tip(&self) -> Result<u64, LogError>;

    /// Reachability probe without side effects.
    async fn ping(&self) -> bool;
}

/// Wakes blocked readers on append or reachability change.
#[derive(Debug)]
pub(crate) struct TailSignal {
    tx: watch::Sender<u64>,
}

impl TailSignal {
    pub(crate) fn new(tip: u64) -> Self {
        let (tx, _) = watch::channel(tip);
        Self { tx }
    }

    pub(crate) fn publish(&self, tip: u64) {
        self.tx.send_replace(tip);
    }

    /// Wake every waiter without moving the tip.
    pub(crate) fn poke(&self) {
        self.tx.send_modify(|_| {});
    }

    /// Re-run `read_after` each time the signal fires until it yields entries.
    pub(crate) async fn wait_for_entries<F>(
        &self,
        cursor: u64,
        timeout: Option<Duration>,
        mut read_after: F,
    ) -> Result<Vec<LogEntry>, LogError>
    where
        F: FnMut(u64) -> Result<Vec<LogEntry>, LogError> + Send,
    {
        let mut rx = self.tx.subscribe();
        let wait = async move {
            loop {
                rx.borrow_and_update();
                let entries = read_after(cursor)?;
                if !entries.is_empty() {
                    return Ok(entries);
                }
                if rx.changed().await.is_err() {
                    return Err(LogError::TransportUnavailable("log closed".into()));
                }
            }
        };

        match timeout {
            None => wait.await,
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => Ok(Vec::new()),
            },
        }
    }
}

#[derive(Debug, Default)]
struct MemoryLogState {
    entries: VecDeque<LogEntry>,
    last_id: u64,
}

/// In-process durable log.
///
/// The reachability switch models the link to a remote log; while it is off
/// every operation fails with [`LogError::TransportUnavailable`] and blocked
/// readers are woken to observe the failure.
#[derive(Debug)]
pub struct MemoryLog {
    state: Mutex<MemoryLogState>,
    reachable: AtomicBool,
    tail: TailSignal,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryLogState::default()),
            reachable: AtomicBool::new(true),
            tail: TailSignal::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        self.tail.poke();
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self) -> Result<(), LogError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(LogError::TransportUnavailable("memory log offline".into()))
        }
    }

    fn read_after(&self, cursor: u64) -> Result<Vec<LogEntry>, LogError> {
        self.check_reachable()?;
        let state = self.lock();
        // Ids are contiguous within the deque, so the start index is direct.
        let first = match state.entries.front() {
            Some(front) => front.id,
            None => return Ok(Vec::new()),
        };
        let skip = cursor.saturating_sub(first - 1) as usize;
        Ok(state.entries.iter().skip(skip).cloned().collect())
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn append(&self, record: &Record) -> Result<u64, LogError> {
        self.check_reachable()?;
        let payload = record.encode().map_err(|e| LogError::Codec(e.to_string()))?;
        let id = {
            let mut state = self.lock();
            state.last_id += 1;
            let id = state.last_id;
            state.entries.push_back(LogEntry::new(id, payload));
            id
        };
        self.tail.publish(id);
        Ok(id)
    }

    async fn read_blocking(
        &self,
        cursor: u64,
        timeout: Option<Duration>,
    ) -> Result<Vec<LogEntry>, LogError> {
        self.tail
            .wait_for_entries(cursor, timeout, |c| self.read_after(c))
            .await
    }

    async fn range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, LogError> {
        self.check_reachable()?;
        let state = self.lock();
        Ok(state
            .entries
            .iter()
            .filter(|e| e.id >= from && e.id <= to)
            .cloned()
            .collect())
    }

    async fn trim(&self, keep_at_least: usize, persisted_through: u64) -> Result<u64, LogError> {
        self.check_reachable()?;
        let mut state = self.lock();
        let mut removed = 0u64;
        while state.entries.len() > keep_at_least {
            match state.entries.front() {
                Some(front) if front.id <= persisted_through => {
                    state.entries.pop_front();
                    removed += 1;
                }
                _ => break,
            }
        }
        Ok(removed)
    }

    async fn tip(&self) -> Result<u64, LogError> {
        self.check_reachable()?;
        Ok(self.lock().last_id)
    }

    async fn ping(&self) -> bool {
        self.is_reachable()
    }
}
