//! Health-driven routing of writes between the log, the store and the
//! fallback buffer.
//!
//! ```text
//!                 probe() ──► Health { log_healthy, store_healthy }
//!                                        │
//!         ┌──────────────┬───────────────┼───────────────┐
//!         ▼              ▼               ▼               ▼
//!      Healthy       StoreDown        LogDown         BothDown
//!   edits → log    edits → log     edits rejected   edits rejected
//!   close → log    close → log     close → store    close → buffer
//! ```
//!
//! Probes are advisory. A write can still fail after a healthy probe, in
//! which case presence-close records cascade to the next reachable
//! destination and finally to the fallback buffer, which cannot fail.

use std::fmt;
use std::sync::Arc;

use crate::protocol::{CellEdit, PresenceRecord, Record};
use crate::storage::{DurableLog, FallbackBuffer, RecordStore, RowId};

/// Liveness status reported when both backends answer.
pub const STATUS_OK: u16 = 200;
/// Liveness status reported when either backend is unreachable.
pub const STATUS_UNAVAILABLE: u16 = 503;

/// Result of one pair of reachability probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    pub log_healthy: bool,
    pub store_healthy: bool,
}

/// Operating mode derived from a [`Health`] probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Healthy,
    StoreDown,
    LogDown,
    BothDown,
}

impl Health {
    pub fn mode(&self) -> Mode {
        match (self.log_healthy, self.store_healthy) {
            (true, true) => Mode::Healthy,
            (true, false) => Mode::StoreDown,
            (false, true) => Mode::LogDown,
            (false, false) => Mode::BothDown,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.log_healthy && self.store_healthy
    }

    /// HTTP-style liveness code.
    pub fn status_code(&self) -> u16 {
        if self.is_healthy() {
            STATUS_OK
        } else {
            STATUS_UNAVAILABLE
        }
    }

    /// Names of the unreachable backends, e.g. `"log, store"`.
    pub fn failed_services(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if !self.log_healthy {
            failed.push("log");
        }
        if !self.store_healthy {
            failed.push("store");
        }
        failed
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_healthy() {
            write!(f, "healthy")
        } else {
            write!(f, "unavailable: {}", self.failed_services().join(", "))
        }
    }
}

impl Mode {
    /// Message attached to a forced-closure presence record.
    fn close_reason(&self) -> Option<&'static str> {
        match self {
            Mode::Healthy => None,
            Mode::StoreDown => Some("store"),
            Mode::LogDown => Some("transport"),
            Mode::BothDown => Some("both"),
        }
    }
}

/// Routing errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouteError {
    /// The log cannot accept the write.
    #[error("log transport unavailable: {0}")]
    TransportUnavailable(String),
    /// Neither the log nor the store is reachable.
    #[error("log and store both unavailable")]
    BothUnavailable,
}

/// Where a presence-close record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDestination {
    Log(u64),
    Store(RowId),
    Fallback(RowId),
    /// The record could not be encoded and was not written anywhere.
    Dropped,
}

/// Owns the three write destinations and picks one per write.
pub struct HealthRouter {
    log: Arc<dyn DurableLog>,
    store: Arc<dyn RecordStore>,
    buffer: Arc<FallbackBuffer>,
}

impl HealthRouter {
    pub fn new(
        log: Arc<dyn DurableLog>,
        store: Arc<dyn RecordStore>,
        buffer: Arc<FallbackBuffer>,
    ) -> Self {
        Self { log, store, buffer }
    }

    pub fn log(&self) -> &Arc<dyn DurableLog> {
        &self.log
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn buffer(&self) -> &Arc<FallbackBuffer> {
        &self.buffer
    }

    /// Ping both backends concurrently.
    pub async fn probe(&self) -> Health {
        let (log_healthy, store_healthy) = tokio::join!(self.log.ping(), self.store.ping());
        Health {
            log_healthy,
            store_healthy,
        }
    }

    /// Liveness code for the current probe: [`STATUS_OK`] or
    /// [`STATUS_UNAVAILABLE`] (503, where earlier deployments used 404).
    pub async fn health_status(&self) -> u16 {
        self.probe().await.status_code()
    }

    /// Stamp `edit` with the session's client id and append it to the log.
    ///
    /// Returns the assigned log id. Edits never go around the log, so any
    /// mode without a reachable log rejects them.
    pub async fn record_edit(&self, client_id: &str, edit: CellEdit) -> Result<u64, RouteError> {
        let health = self.probe().await;
        match health.mode() {
            Mode::Healthy | Mode::StoreDown => {}
            Mode::LogDown => {
                return Err(RouteError::TransportUnavailable(health.to_string()));
            }
            Mode::BothDown => return Err(RouteError::BothUnavailable),
        }

        let record = Record::Edit(edit.stamp(client_id));
        self.log
            .append(&record)
            .await
            .map_err(|e| RouteError::TransportUnavailable(e.to_string()))
    }

    /// Announce a session after its bootstrap succeeded.
    pub async fn record_open(&self, client_id: &str) -> Result<u64, RouteError> {
        let record = Record::User(PresenceRecord::open(client_id));
        self.log
            .append(&record)
            .await
            .map_err(|e| RouteError::TransportUnavailable(e.to_string()))
    }

    /// Record the end of a session in the place the current mode allows.
    pub async fn record_close(&self, client_id: &str) -> CloseDestination {
        let health = self.probe().await;
        let mode = health.mode();
        let presence = match mode.close_reason() {
            None => PresenceRecord::closed(client_id),
            Some(reason) => PresenceRecord::error(client_id, reason),
        };
        let record = Record::User(presence);

        if health.log_healthy {
            match self.log.append(&record).await {
                Ok(id) => return CloseDestination::Log(id),
                Err(e) => log::warn!("Close record for {client_id} missed the log: {e}"),
            }
        }

        let payload = match record.encode() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to encode close record for {client_id}: {e}");
                return CloseDestination::Dropped;
            }
        };
        let id = RowId::out_of_band();

        if health.store_healthy {
            match self.store.insert_if_absent(id, &payload).await {
                Ok(_) => return CloseDestination::Store(id),
                Err(e) => log::warn!("Close record for {client_id} missed the store: {e}"),
            }
        }

        log::warn!("Buffering close record for {client_id} ({health})");
        self.buffer.add(id, payload);
        CloseDestination::Fallback(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PresenceStatus;
    use crate::storage::{MemoryLog, MemoryStore};

    struct Fixture {
        log: Arc<MemoryLog>,
        store: Arc<MemoryStore>,
        buffer: Arc<FallbackBuffer>,
        router: HealthRouter,
    }

    fn fixture() -> Fixture {
        let log = Arc::new(MemoryLog::new());
        let store = Arc::new(MemoryStore::new());
        let buffer = Arc::new(FallbackBuffer::new());
        let router = HealthRouter::new(log.clone(), store.clone(), buffer.clone());
        Fixture {
            log,
            store,
            buffer,
            router,
        }
    }

    async fn presence_at(log: &MemoryLog, id: u64) -> PresenceRecord {
        let entry = log.range(id, id).await.unwrap().remove(0);
        match entry.record().unwrap() {
            Record::User(p) => p,
            other => panic!("expected presence, got {other:?}"),
        }
    }

    #[test]
    fn test_mode_classification() {
        let h = |log_healthy, store_healthy| Health {
            log_healthy,
            store_healthy,
        };
        assert_eq!(h(true, true).mode(), Mode::Healthy);
        assert_eq!(h(true, false).mode(), Mode::StoreDown);
        assert_eq!(h(false, true).mode(), Mode::LogDown);
        assert_eq!(h(false, false).mode(), Mode::BothDown);
        assert_eq!(h(true, true).status_code(), 200);
        assert_eq!(h(true, false).status_code(), 503);
        assert_eq!(h(false, false).to_string(), "unavailable: log, store");
    }

    #[tokio::test]
    async fn test_probe_reflects_reachability() {
        let f = fixture();
        assert!(f.router.probe().await.is_healthy());
        f.store.set_reachable(false);
        assert_eq!(f.router.probe().await.mode(), Mode::StoreDown);
        assert_eq!(f.router.health_status().await, STATUS_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_status_is_503_when_degraded() {
        let f = fixture();
        assert_eq!(f.router.health_status().await, 200);
        f.log.set_reachable(false);
        assert_eq!(f.router.health_status().await, 503);
        f.store.set_reachable(false);
        assert_eq!(f.router.health_status().await, 503);
        f.log.set_reachable(true);
        f.store.set_reachable(true);
        assert_eq!(f.router.health_status().await, 200);
    }

    #[tokio::test]
    async fn test_edit_stamped_and_appended() {
        let f = fixture();
        let id = f
            .router
            .record_edit("client-a", CellEdit::new("2", "3", "9"))
            .await
            .unwrap();
        let entry = f.log.range(id, id).await.unwrap().remove(0);
        match entry.record().unwrap() {
            Record::Edit(e) => {
                assert_eq!(e.user, "client-a");
                assert_eq!(e.cell_key(), "2-3");
                assert!(e.timestamp > 0);
            }
            other => panic!("expected edit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_edit_flows_while_store_down() {
        let f = fixture();
        f.store.set_reachable(false);
        assert!(f.router.record_edit("a", CellEdit::new("0", "0", "1")).await.is_ok());
        assert_eq!(f.log.len(), 1);
    }

    #[tokio::test]
    async fn test_edit_rejected_without_log() {
        let f = fixture();
        f.log.set_reachable(false);
        let err = f
            .router
            .record_edit("a", CellEdit::new("0", "0", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::TransportUnavailable(_)));

        f.store.set_reachable(false);
        let err = f
            .router
            .record_edit("a", CellEdit::new("0", "0", "1"))
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::BothUnavailable);
    }

    #[tokio::test]
    async fn test_close_healthy_goes_to_log() {
        let f = fixture();
        let dest = f.router.record_close("a").await;
        let CloseDestination::Log(id) = dest else {
            panic!("expected log destination, got {dest:?}");
        };
        let presence = presence_at(&f.log, id).await;
        assert_eq!(presence.status, PresenceStatus::Closed);
        assert!(presence.message.is_none());
    }

    #[tokio::test]
    async fn test_close_store_down_goes_to_log_with_error() {
        let f = fixture();
        f.store.set_reachable(false);
        let CloseDestination::Log(id) = f.router.record_close("a").await else {
            panic!("expected log destination");
        };
        let presence = presence_at(&f.log, id).await;
        assert_eq!(presence.status, PresenceStatus::Error);
        assert_eq!(presence.message.as_deref(), Some("store"));
    }

    #[tokio::test]
    async fn test_close_log_down_goes_to_store() {
        let f = fixture();
        f.log.set_reachable(false);
        let CloseDestination::Store(id) = f.router.record_close("a").await else {
            panic!("expected store destination");
        };
        assert!(id.is_out_of_band());
        let rows = f.store.scan_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].payload.contains("\"transport\""));
        assert!(f.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_close_both_down_goes_to_buffer() {
        let f = fixture();
        f.log.set_reachable(false);
        f.store.set_reachable(false);
        let CloseDestination::Fallback(id) = f.router.record_close("a").await else {
            panic!("expected fallback destination");
        };
        assert!(f.buffer.contains(&id));
        let (_, payload) = f.buffer.values().remove(0);
        match Record::decode(&payload).unwrap() {
            Record::User(p) => assert_eq!(p.message.as_deref(), Some("both")),
            other => panic!("expected presence, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_record_appended() {
        let f = fixture();
        let id = f.router.record_open("a").await.unwrap();
        assert_eq!(presence_at(&f.log, id).await.status, PresenceStatus::Open);
    }
}
