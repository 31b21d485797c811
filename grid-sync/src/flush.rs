//! Periodic move of log entries into the store, followed by log trimming.
//!
//! One cycle:
//! ```text
//!   probe ─┬─ store up ──► drain fallback buffer
//!          ├─ log down ──► Unhealthy (caller notifies sessions)
//!          └─ log up ────► read_blocking(last_processed, read_timeout)
//!                              │ empty ──► Idle
//!                              ▼
//!                          insert all ──► any failed ──► Failed (retry same range)
//!                              │ all ok
//!                              ▼
//!                          trim(max_retained, floor = batch tip), advance
//! ```
//!
//! Cycles run on a single task driven by `tokio::time::interval`, so a slow
//! cycle delays the next tick instead of overlapping it.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

use crate::health::{Health, HealthRouter};
use crate::storage::{DrainReport, RowId};

/// Flush scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushConfig {
    /// Time between cycle starts
    pub interval: Duration,
    /// How long a cycle waits for new log entries (default: 5s)
    pub read_timeout: Duration,
    /// Minimum number of entries the log keeps after a trim (default: 500)
    pub max_retained: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            read_timeout: Duration::from_millis(5000),
            max_retained: 500,
        }
    }
}

impl FlushConfig {
    /// Short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(50),
            read_timeout: Duration::from_millis(20),
            max_retained: 500,
        }
    }
}

/// Result of one flush cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No new log entries within the read timeout.
    Idle,
    /// Every entry of the batch is in the store.
    Flushed { rows_inserted: u64, num_trimmed: u64 },
    /// Some inserts failed; nothing was trimmed and the range will be retried.
    Failed { rows_failed: u64 },
    /// The log could not be read.
    Unhealthy(Health),
}

/// Drives flush cycles and remembers how far the store has caught up.
pub struct FlushScheduler {
    router: Arc<HealthRouter>,
    config: FlushConfig,
    /// Highest log id confirmed in the store
    last_processed: u64,
}

impl FlushScheduler {
    pub fn new(router: Arc<HealthRouter>, config: FlushConfig) -> Self {
        Self {
            router,
            config,
            last_processed: 0,
        }
    }

    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    pub fn last_processed(&self) -> u64 {
        self.last_processed
    }

    /// Tick source for the flush task.
    pub fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Run one cycle to completion.
    pub async fn run_cycle(&mut self) -> FlushOutcome {
        let health = self.router.probe().await;

        if health.store_healthy {
            match self.router.buffer().drain_and_persist(self.router.store().as_ref()).await {
                DrainReport::Empty => {}
                DrainReport::Success {
                    rows_inserted,
                    num_remaining,
                } => log::info!(
                    "Fallback drain: {rows_inserted} rows inserted, {num_remaining} remaining"
                ),
                DrainReport::Failed { rows_failed } => {
                    log::error!("Fallback drain failed for {rows_failed} rows")
                }
            }
        }

        if !health.log_healthy {
            return FlushOutcome::Unhealthy(health);
        }

        let batch = match self
            .router
            .log()
            .read_blocking(self.last_processed, Some(self.config.read_timeout))
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("Flush read failed: {e}");
                return FlushOutcome::Unhealthy(Health {
                    log_healthy: false,
                    ..health
                });
            }
        };
        let Some(batch_tip) = batch.last().map(|entry| entry.id) else {
            return FlushOutcome::Idle;
        };

        let store = self.router.store();
        let outcomes = join_all(
            batch
                .iter()
                .map(|entry| store.insert_if_absent(RowId::Log(entry.id), &entry.payload)),
        )
        .await;

        let mut rows_inserted = 0u64;
        let mut rows_failed = 0u64;
        for outcome in outcomes {
            match outcome {
                Ok(affected) => rows_inserted += affected,
                Err(_) => rows_failed += 1,
            }
        }
        if rows_failed > 0 {
            log::error!(
                "Flush of log ids {}..={batch_tip} failed for {rows_failed} rows",
                self.last_processed + 1
            );
            return FlushOutcome::Failed { rows_failed };
        }

        self.last_processed = batch_tip;
        let num_trimmed = match self
            .router
            .log()
            .trim(self.config.max_retained, batch_tip)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                // Persisted already; the next cycle trims instead.
                log::warn!("Log trim failed: {e}");
                0
            }
        };

        log::debug!(
            "Flushed through log id {batch_tip}: {rows_inserted} inserted, {num_trimmed} trimmed"
        );
        FlushOutcome::Flushed {
            rows_inserted,
            num_trimmed,
        }
    }
}
