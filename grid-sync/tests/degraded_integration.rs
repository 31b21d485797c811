//! Degraded-mode integration tests.
//!
//! Drives the router, flush scheduler and bootstrap together through
//! backend outages and recoveries, without a socket in between.

use grid_sync::protocol::CellEdit;
use grid_sync::storage::{DurableLog, FallbackBuffer, MemoryLog, MemoryStore, RowId};
use grid_sync::{
    reconcile, BootstrapError, CloseDestination, FlushConfig, FlushOutcome, FlushScheduler,
    HealthRouter, Mode, RouteError,
};
use std::sync::Arc;

struct System {
    log: Arc<MemoryLog>,
    store: Arc<MemoryStore>,
    buffer: Arc<FallbackBuffer>,
    router: Arc<HealthRouter>,
    flush: FlushScheduler,
}

fn system(max_retained: usize) -> System {
    let log = Arc::new(MemoryLog::new());
    let store = Arc::new(MemoryStore::new());
    let buffer = Arc::new(FallbackBuffer::new());
    let router = Arc::new(HealthRouter::new(log.clone(), store.clone(), buffer.clone()));
    let config = FlushConfig {
        max_retained,
        ..FlushConfig::for_testing()
    };
    let flush = FlushScheduler::new(router.clone(), config);
    System {
        log,
        store,
        buffer,
        router,
        flush,
    }
}

#[tokio::test]
async fn test_crash_closure_survives_both_down_and_wins_bootstrap() {
    let mut s = system(500);
    s.router.record_open("A").await.unwrap();
    s.router
        .record_edit("A", CellEdit::new("X", "0", "1"))
        .await
        .unwrap();
    assert!(matches!(s.flush.run_cycle().await, FlushOutcome::Flushed { .. }));

    s.router
        .record_edit("B", CellEdit::new("X", "0", "2"))
        .await
        .unwrap();

    // A's connection drops while nothing is reachable.
    s.log.set_reachable(false);
    s.store.set_reachable(false);
    assert_eq!(s.router.probe().await.mode(), Mode::BothDown);
    let dest = s.router.record_close("A").await;
    assert!(matches!(dest, CloseDestination::Fallback(_)));
    assert_eq!(s.buffer.len(), 1);

    // No bootstrap while degraded.
    assert!(matches!(
        reconcile(&s.router).await,
        Err(BootstrapError::Unavailable(_))
    ));

    s.log.set_reachable(true);
    s.store.set_reachable(true);
    let snapshot = reconcile(&s.router).await.unwrap();
    let cell = &snapshot.cells["X-0"];
    assert_eq!(cell.value, "2");
    assert_eq!(cell.user, "B");
    assert_eq!(cell.id, RowId::Log(3));
    assert!(!snapshot.users.contains_key("A"));
}

#[tokio::test]
async fn test_buffer_drains_once_store_returns() {
    let mut s = system(500);
    s.log.set_reachable(false);
    s.store.set_reachable(false);
    for client in ["a", "b", "c"] {
        s.router.record_close(client).await;
    }
    assert_eq!(s.buffer.len(), 3);

    // Log still down: drain happens, log read does not.
    s.store.set_reachable(true);
    assert!(matches!(s.flush.run_cycle().await, FlushOutcome::Unhealthy(_)));
    assert!(s.buffer.is_empty());
    assert_eq!(s.store.len(), 3);
}

#[tokio::test]
async fn test_edits_keep_flowing_while_store_down() {
    let mut s = system(0);
    s.store.set_reachable(false);

    let mut ids = Vec::new();
    for i in 0..5 {
        let id = s
            .router
            .record_edit("a", CellEdit::new("0", i.to_string(), "v"))
            .await
            .unwrap();
        ids.push(id);
    }
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    // Nothing persisted, so nothing may be trimmed.
    assert_eq!(
        s.flush.run_cycle().await,
        FlushOutcome::Failed { rows_failed: 5 }
    );
    assert_eq!(s.log.len(), 5);

    s.store.set_reachable(true);
    assert_eq!(
        s.flush.run_cycle().await,
        FlushOutcome::Flushed {
            rows_inserted: 5,
            num_trimmed: 5
        }
    );
    assert!(s.log.is_empty());
    assert_eq!(s.log.tip().await.unwrap(), 5);
}

#[tokio::test]
async fn test_edits_rejected_while_log_down() {
    let s = system(500);
    s.log.set_reachable(false);
    let err = s
        .router
        .record_edit("a", CellEdit::new("0", "0", "v"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::TransportUnavailable(_)));
    assert_eq!(s.store.len(), 0);
    assert!(s.buffer.is_empty());
}

#[tokio::test]
async fn test_flushed_store_retains_every_entry_and_log_keeps_minimum() {
    let mut s = system(3);
    for i in 0..20 {
        s.router
            .record_edit("a", CellEdit::new(i.to_string(), "0", "v"))
            .await
            .unwrap();
    }
    assert!(matches!(s.flush.run_cycle().await, FlushOutcome::Flushed { .. }));
    assert!(s.log.len() >= 3);
    for id in 1..=20 {
        assert!(s.store.contains(&RowId::Log(id)));
    }
}
