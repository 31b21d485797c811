//! WebSocket server wiring sessions, the health router and the flush task.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── SessionTail (A) ◄──┐
//!             ├── handle_connection ─┤                      │ read_blocking
//! Client B ──┘   EDIT → SAVE ack     └── SessionTail (B) ◄──┤
//!                     │                                     │
//!                     ▼                                     │
//!               HealthRouter ────────── append ──────► DurableLog
//!                     │                                     │
//!                     │ log down                flush task  │
//!                     ▼                                     ▼
//!               FallbackBuffer ──────── drain ───────► RecordStore
//! ```
//!
//! Connection lifecycle: bootstrap snapshot, open presence, then the
//! client's frames and its log tail are served side by side until either
//! end closes. The close presence is recorded on the way out.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::bootstrap;
use crate::flush::{FlushConfig, FlushOutcome, FlushScheduler};
use crate::health::HealthRouter;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::session::{Outbound, Session, SessionRegistry, SessionTail};
use crate::storage::{
    DurableLog, FallbackBuffer, LogError, MemoryLog, MemoryStore, RecordStore, RocksConfig,
    RocksLog, RocksStore, StoreError,
};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Flush cycle timing and log retention
    pub flush: FlushConfig,
    /// Frames queued per session before the tail waits on the socket
    pub outbound_capacity: usize,
    /// RocksDB directory for the log (None = in-memory)
    pub log_path: Option<PathBuf>,
    /// RocksDB directory for the store (None = in-memory)
    pub store_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            flush: FlushConfig::default(),
            outbound_capacity: 256,
            log_path: None,
            store_path: None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

impl ServerConfig {
    /// Read overrides from the process environment.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `GRID_BIND_ADDR` | `bind_addr` |
    /// | `PORT` | `bind_addr` as `0.0.0.0:{PORT}` when `GRID_BIND_ADDR` is unset |
    /// | `GRID_SAVE_INTERVAL_MS` | `flush.interval` |
    /// | `GRID_SAVE_TIMEOUT_MS` | `flush.read_timeout` |
    /// | `GRID_MAX_RETAINED` | `flush.max_retained` |
    /// | `GRID_LOG_PATH` | `log_path` |
    /// | `GRID_STORE_PATH` | `store_path` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ServerConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("GRID_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = parse("PORT", &port)?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(ms) = lookup("GRID_SAVE_INTERVAL_MS") {
            config.flush.interval = Duration::from_millis(parse_positive("GRID_SAVE_INTERVAL_MS", &ms)?);
        }
        if let Some(ms) = lookup("GRID_SAVE_TIMEOUT_MS") {
            config.flush.read_timeout = Duration::from_millis(parse_positive("GRID_SAVE_TIMEOUT_MS", &ms)?);
        }
        if let Some(n) = lookup("GRID_MAX_RETAINED") {
            config.flush.max_retained = parse("GRID_MAX_RETAINED", &n)?;
        }
        config.log_path = lookup("GRID_LOG_PATH").map(PathBuf::from);
        config.store_path = lookup("GRID_STORE_PATH").map(PathBuf::from);

        Ok(config)
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_positive(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    match parse::<u64>(key, value)? {
        0 => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
        n => Ok(n),
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub edits_saved: u64,
    pub edits_rejected: u64,
    pub flush_cycles: u64,
    pub rows_flushed: u64,
    pub rows_trimmed: u64,
    pub flush_failures: u64,
    /// Sessions closed by a server-wide `SYSTEM_ERROR`
    pub system_errors: u64,
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    router: Arc<HealthRouter>,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Open the configured backends and build a server over them.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let log: Arc<dyn DurableLog> = match &config.log_path {
            Some(path) => Arc::new(RocksLog::open(RocksConfig::at(path))?),
            None => Arc::new(MemoryLog::new()),
        };
        let store: Arc<dyn RecordStore> = match &config.store_path {
            Some(path) => Arc::new(RocksStore::open(RocksConfig::at(path))?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_backends(config, log, store))
    }

    /// Build a server over caller-supplied backends.
    pub fn with_backends(
        config: ServerConfig,
        log: Arc<dyn DurableLog>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let buffer = Arc::new(FallbackBuffer::new());
        Self {
            config,
            router: Arc::new(HealthRouter::new(log, store, buffer)),
            registry: Arc::new(SessionRegistry::new()),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory backends, default configuration.
    pub fn with_defaults() -> Self {
        Self::with_backends(
            ServerConfig::default(),
            Arc::new(MemoryLog::new()),
            Arc::new(MemoryStore::new()),
        )
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Grid sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    ///
    /// A flush task that dies is logged and started again.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut flush = self.spawn_flush();
        loop {
            tokio::select! {
                result = self.accept_loop(&listener) => {
                    flush.abort();
                    return result;
                }
                joined = &mut flush => {
                    match joined {
                        Err(e) if e.is_panic() => log::error!("Flush task panicked; restarting"),
                        Err(e) => log::error!("Flush task stopped: {e}; restarting"),
                        Ok(()) => log::error!("Flush task exited; restarting"),
                    }
                    flush = self.spawn_flush();
                }
            }
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Start the flush task. Cycles never overlap.
    pub fn spawn_flush(&self) -> JoinHandle<()> {
        let mut scheduler = FlushScheduler::new(self.router.clone(), self.config.flush.clone());
        let registry = self.registry.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let mut ticker = scheduler.ticker();
            loop {
                ticker.tick().await;
                let outcome = scheduler.run_cycle().await;
                Self::record_flush(&stats, &registry, outcome).await;
            }
        })
    }

    async fn record_flush(
        stats: &RwLock<ServerStats>,
        registry: &SessionRegistry,
        outcome: FlushOutcome,
    ) {
        let notified = match &outcome {
            FlushOutcome::Unhealthy(health) => {
                log::warn!("Flush skipped, {health}; closing sessions");
                registry
                    .broadcast_system_error(&format!("Service {health}"))
                    .await as u64
            }
            _ => 0,
        };

        let mut s = stats.write().await;
        s.flush_cycles += 1;
        s.system_errors += notified;
        match outcome {
            FlushOutcome::Flushed {
                rows_inserted,
                num_trimmed,
            } => {
                s.rows_flushed += rows_inserted;
                s.rows_trimmed += num_trimmed;
            }
            FlushOutcome::Failed { .. } => s.flush_failures += 1,
            FlushOutcome::Idle | FlushOutcome::Unhealthy(_) => {}
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let mut client_key: Option<String> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                client_key = req
                    .headers()
                    .get("sec-websocket-key")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                Ok(resp)
            },
        )
        .await?;
        let client_id = client_key.unwrap_or_else(|| Uuid::new_v4().to_string());
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("Session {client_id} connected from {addr}");
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = self
            .run_session(&client_id, &mut ws_sender, &mut ws_receiver)
            .await;

        self.registry.unregister(&client_id).await;
        let destination = self.router.record_close(&client_id).await;
        log::info!("Session {client_id} closed (presence recorded in {destination:?})");
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    async fn run_session(
        &self,
        client_id: &str,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
    ) -> Result<(), ServerError> {
        // Taken before the snapshot so nothing appended meanwhile is missed.
        let cursor = match self.router.log().tip().await {
            Ok(tip) => tip,
            Err(e) => return Self::refuse(ws_sender, &e.to_string()).await,
        };
        let snapshot = match bootstrap::reconcile(&self.router).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Self::refuse(ws_sender, &e.to_string()).await,
        };
        for msg in snapshot.into_messages() {
            Self::send(ws_sender, &msg).await?;
        }
        if let Err(e) = self.router.record_open(client_id).await {
            log::warn!("Open presence for {client_id} not recorded: {e}");
        }

        let (tx, mut rx) = mpsc::channel(self.config.outbound_capacity);
        self.registry.register(client_id, tx.clone()).await;
        let tail = SessionTail::spawn(
            self.router.log().clone(),
            Session::new(client_id, cursor),
            tx,
        );

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.stats.write().await.total_messages += 1;
                            match ClientMessage::decode(text.as_str()) {
                                Ok(ClientMessage::Edit(edit)) => {
                                    match self.router.record_edit(client_id, edit).await {
                                        Ok(id) => {
                                            Self::send(ws_sender, &ServerMessage::saved(id)).await?;
                                            self.stats.write().await.edits_saved += 1;
                                        }
                                        Err(e) => {
                                            log::warn!("Edit from {client_id} rejected: {e}");
                                            self.stats.write().await.edits_rejected += 1;
                                            Self::send(ws_sender, &ServerMessage::save_failed()).await?;
                                            Self::refuse(ws_sender, &e.to_string()).await?;
                                            break;
                                        }
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Ignoring frame from {client_id}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Session {client_id}: client closed");
                            break;
                        }

                        Some(Err(e)) => {
                            log::debug!("Session {client_id}: websocket error: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                out = rx.recv() => {
                    match out {
                        Some(Outbound::Text(text)) => {
                            ws_sender.send(Message::Text(text.into())).await?;
                        }
                        Some(Outbound::Close) | None => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        }

        tail.abort();
        Ok(())
    }

    async fn send(ws_sender: &mut WsSink, msg: &ServerMessage) -> Result<(), ServerError> {
        let text = msg.encode()?;
        ws_sender.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Tell the client why, then close.
    async fn refuse(ws_sender: &mut WsSink, message: &str) -> Result<(), ServerError> {
        Self::send(ws_sender, &ServerMessage::system_error(message)).await?;
        let _ = ws_sender.send(Message::Close(None)).await;
        Ok(())
    }

    /// Liveness code: 200 when both backends answer, 503 otherwise.
    pub async fn health_status(&self) -> u16 {
        self.router.health_status().await
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<HealthRouter> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}
