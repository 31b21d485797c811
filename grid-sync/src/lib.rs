//! # grid-sync — Real-time multi-user grid editing backend
//!
//! Clients edit a shared grid of cells over WebSocket. Every edit goes
//! through a durable, ordered log; each session tails that log to see the
//! others' edits, and a flush cycle moves the log into an idempotent store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   EDIT / SAVE    ┌──────────────┐  append   ┌────────────┐
//! │ Grid client │ ◄──────────────► │  SyncServer  │ ────────► │ DurableLog │
//! └─────────────┘   DATA / EDIT    │  (sessions)  │ ◄──────── │            │
//!                   USER           └──────┬───────┘   tail    └─────┬──────┘
//!                                         │ both down               │ flush
//!                                         ▼                         ▼
//!                                  ┌──────────────┐  drain   ┌────────────┐
//!                                  │FallbackBuffer│ ───────► │RecordStore │
//!                                  └──────────────┘          └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames and log records
//! - [`storage`] — Durable log, persistent store, fallback buffer (memory and RocksDB)
//! - [`health`] — Reachability probes and write routing per mode
//! - [`session`] — Per-client log tail with self-suppression
//! - [`bootstrap`] — Snapshot reconstruction for new sessions
//! - [`flush`] — Periodic persist-then-trim cycle
//! - [`server`] — WebSocket server and configuration

pub mod bootstrap;
pub mod flush;
pub mod health;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use bootstrap::{reconcile, BootstrapError, GridSnapshot};
pub use flush::{FlushConfig, FlushOutcome, FlushScheduler};
pub use health::{CloseDestination, Health, HealthRouter, Mode, RouteError};
pub use protocol::{
    CellEdit, CellState, ClientMessage, DataPayload, EditRecord, PresenceRecord, PresenceStatus,
    ProtocolError, Record, ServerMessage,
};
pub use server::{ConfigError, ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{Outbound, Session, SessionRegistry, SessionTail, TailExit};
pub use storage::{
    DrainReport, DurableLog, FallbackBuffer, LogEntry, LogError, MemoryLog, MemoryStore,
    RecordStore, RocksConfig, RocksLog, RocksStore, RowId, StoreError, StoredRow,
};
