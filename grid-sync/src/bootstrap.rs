//! Initial grid snapshot for a new session.
//!
//! Three sources overlap, and are applied in this order:
//!
//! 1. Store rows, ascending by id. The highest log-assigned id among them
//!    is the watermark; out-of-band rows never move it.
//! 2. Log entries above the watermark, ascending.
//! 3. Fallback buffer entries, unconditionally. They record sessions that
//!    crashed without a path to the log and must win.
//!
//! An open presence adds the user, any other status removes it. An edit
//! replaces its cell.

use std::collections::BTreeMap;

use crate::health::{Health, HealthRouter};
use crate::protocol::{CellState, DataPayload, PresenceRecord, PresenceStatus, Record, ServerMessage};
use crate::storage::{LogEntry, LogError, RowId, StoreError, StoredRow};

/// Bootstrap errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BootstrapError {
    /// A backend failed its probe; nothing was read.
    #[error("cannot bootstrap, {0}")]
    Unavailable(Health),
    #[error("cannot read log: {0}")]
    Log(#[from] LogError),
    #[error("cannot read store: {0}")]
    Store(#[from] StoreError),
}

/// Current users and cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridSnapshot {
    pub users: BTreeMap<String, PresenceRecord>,
    pub cells: BTreeMap<String, CellState>,
}

impl GridSnapshot {
    /// Merge the three sources.
    pub fn build(
        mut rows: Vec<StoredRow>,
        mut entries: Vec<LogEntry>,
        mut fallback: Vec<(RowId, String)>,
    ) -> Self {
        let mut snapshot = Self::default();

        rows.sort_by_key(|row| row.id);
        let mut watermark = 0u64;
        for row in rows {
            if let Some(id) = row.id.log_id() {
                watermark = watermark.max(id);
            }
            snapshot.apply_payload(row.id, &row.payload);
        }

        entries.sort_by_key(|entry| entry.id);
        for entry in entries.into_iter().filter(|e| e.id > watermark) {
            snapshot.apply_payload(RowId::Log(entry.id), &entry.payload);
        }

        fallback.sort();
        for (id, payload) in fallback {
            snapshot.apply_payload(id, &payload);
        }

        snapshot
    }

    fn apply_payload(&mut self, id: RowId, payload: &str) {
        match Record::decode(payload) {
            Ok(record) => self.apply(id, record),
            Err(e) => log::warn!("Bootstrap skipping row {id}: {e}"),
        }
    }

    /// Apply one record.
    pub fn apply(&mut self, id: RowId, record: Record) {
        match record {
            Record::User(presence) => {
                if presence.status == PresenceStatus::Open {
                    self.users.insert(presence.user.clone(), presence);
                } else {
                    self.users.remove(&presence.user);
                }
            }
            Record::Edit(edit) => {
                let key = edit.cell_key();
                self.cells.insert(
                    key,
                    CellState {
                        value: edit.value,
                        user: edit.user,
                        id,
                    },
                );
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.cells.is_empty()
    }

    /// `DATA user` then `DATA data`, each left out when empty.
    pub fn into_messages(self) -> Vec<ServerMessage> {
        let mut messages = Vec::with_capacity(2);
        if !self.users.is_empty() {
            messages.push(ServerMessage::Data(DataPayload::User(self.users)));
        }
        if !self.cells.is_empty() {
            messages.push(ServerMessage::Data(DataPayload::Data(self.cells)));
        }
        messages
    }
}

/// Build the snapshot a new session starts from.
pub async fn reconcile(router: &HealthRouter) -> Result<GridSnapshot, BootstrapError> {
    let health = router.probe().await;
    if !health.is_healthy() {
        log::warn!("Bootstrap refused: {health}");
        return Err(BootstrapError::Unavailable(health));
    }

    let buffer = router.buffer().clone();
    let (fallback, rows, entries) = tokio::join!(
        async move { buffer.values() },
        router.store().scan_all(),
        router.log().range(0, u64::MAX),
    );
    let (rows, entries) = (rows?, entries?);

    log::debug!(
        "Bootstrap from {} store rows, {} log entries, {} buffered",
        rows.len(),
        entries.len(),
        fallback.len()
    );
    Ok(GridSnapshot::build(rows, entries, fallback))
}
