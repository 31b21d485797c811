//! Per-client log tailing and session bookkeeping.
//!
//! Every connected client owns one tail task:
//!
//! ```text
//!   loop {
//!       batch = log.read_blocking(cursor, ∞)   ── TransportUnavailable ──► SYSTEM_ERROR, close
//!       for entry in batch {
//!           cursor = entry.id
//!           if entry.author != client_id { outbound.send(entry.payload) }
//!       }
//!   }
//! ```
//!
//! The task is aborted when the connection goes away, so a suspended read
//! never outlives its client. The [`SessionRegistry`] keeps each session's
//! outbound channel so server-wide failures can reach every client.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::protocol::ServerMessage;
use crate::storage::{DurableLog, LogEntry, LogError};

/// How long a server-wide notice waits on a session's full outbound queue.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// Frames queued for a client's socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Pre-encoded JSON text frame.
    Text(String),
    /// Close the connection after everything queued before it.
    Close,
}

impl Outbound {
    pub fn message(msg: &ServerMessage) -> Option<Self> {
        match msg.encode() {
            Ok(text) => Some(Outbound::Text(text)),
            Err(e) => {
                log::error!("Failed to encode outbound message: {e}");
                None
            }
        }
    }
}

/// Tail position of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    client_id: String,
    cursor: u64,
}

impl Session {
    /// New session positioned at `cursor` (normally the log tip at connect).
    pub fn new(client_id: impl Into<String>, cursor: u64) -> Self {
        Self {
            client_id: client_id.into(),
            cursor,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Last log id this session has seen.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Move past `batch`, returning the payloads to deliver.
    ///
    /// The cursor advances over every entry, including the session's own
    /// and undecodable ones, so nothing is examined twice.
    pub fn advance(&mut self, batch: Vec<LogEntry>) -> Vec<String> {
        let mut deliver = Vec::with_capacity(batch.len());
        for entry in batch {
            if entry.id <= self.cursor {
                continue;
            }
            self.cursor = entry.id;
            match entry.record() {
                Ok(record) if record.author() == self.client_id => {}
                Ok(_) => deliver.push(entry.payload),
                Err(e) => {
                    log::warn!(
                        "Session {}: skipping log entry {}: {e}",
                        self.client_id,
                        entry.id
                    );
                }
            }
        }
        deliver
    }
}

/// Why a tail loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TailExit {
    /// The log failed; the client was sent `SYSTEM_ERROR` and a close.
    LogUnavailable(LogError),
    /// The connection's outbound channel is gone.
    Disconnected,
}

/// Tail the log for `session`, forwarding entries to `outbound`.
pub async fn run_tail(
    log: Arc<dyn DurableLog>,
    mut session: Session,
    outbound: mpsc::Sender<Outbound>,
) -> TailExit {
    loop {
        let batch = match log.read_blocking(session.cursor(), None).await {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("Session {} lost the log: {e}", session.client_id());
                if let Some(frame) = Outbound::message(&ServerMessage::system_error(e.to_string())) {
                    let _ = outbound.send(frame).await;
                }
                let _ = outbound.send(Outbound::Close).await;
                return TailExit::LogUnavailable(e);
            }
        };

        for payload in session.advance(batch) {
            if outbound.send(Outbound::Text(payload)).await.is_err() {
                return TailExit::Disconnected;
            }
        }
    }
}

/// Handle to a running tail task. Dropping it aborts the task.
#[derive(Debug)]
pub struct SessionTail {
    handle: JoinHandle<TailExit>,
}

impl SessionTail {
    pub fn spawn(
        log: Arc<dyn DurableLog>,
        session: Session,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            handle: tokio::spawn(run_tail(log, session, outbound)),
        }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SessionTail {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Live sessions keyed by client id.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, mpsc::Sender<Outbound>>>,
    total_registered: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            total_registered: AtomicU64::new(0),
        }
    }

    pub async fn register(&self, client_id: impl Into<String>, outbound: mpsc::Sender<Outbound>) {
        let client_id = client_id.into();
        let mut sessions = self.sessions.write().await;
        if sessions.insert(client_id.clone(), outbound).is_some() {
            log::warn!("Session {client_id} registered twice; replacing the older channel");
        }
        self.total_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn unregister(&self, client_id: &str) -> bool {
        self.sessions.write().await.remove(client_id).is_some()
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.sessions.read().await.contains_key(client_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sessions registered since startup.
    pub fn total_registered(&self) -> u64 {
        self.total_registered.load(Ordering::Relaxed)
    }

    /// Send `SYSTEM_ERROR` followed by a close to every live session.
    ///
    /// Returns how many sessions were notified. A session whose queue stays
    /// full for [`NOTIFY_TIMEOUT`] or whose channel is closed is skipped.
    pub async fn broadcast_system_error(&self, message: &str) -> usize {
        let Some(frame) = Outbound::message(&ServerMessage::system_error(message)) else {
            return 0;
        };
        let targets: Vec<(String, mpsc::Sender<Outbound>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect()
        };

        let outcomes = join_all(targets.iter().map(|(client_id, outbound)| {
            let frame = frame.clone();
            async move {
                let sent = outbound.send_timeout(frame, NOTIFY_TIMEOUT).await.is_ok()
                    && outbound
                        .send_timeout(Outbound::Close, NOTIFY_TIMEOUT)
                        .await
                        .is_ok();
                if !sent {
                    log::debug!("Session {client_id} not notified of system error");
                }
                sent
            }
        }))
        .await;
        outcomes.into_iter().filter(|sent| *sent).count()
    }
}
