//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── AuthorizationGuard
//!            ├── connection task ──► SyncCoordinator ──┼── DocumentStore (memory | RocksDB)
//! Client B ──┘   (one per socket)     │                 └── BlockTreeCodec
//!                     ▲               ▼
//!                     └──── outbox ◄─ SessionRegistry (membership + fan-out)
//! ```
//!
//! Each connection task handles its own events one at a time, in order. A
//! slow store call only delays the connection that issued it; everything a
//! session receives arrives through its registry outbox.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 3 & 8

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{AuthorizationGuard, TokenVerifier, DEFAULT_LEEWAY_SECS};
use crate::codec::ReconstructMode;
use crate::coordinator::{CoordinatorConfig, SyncCoordinator};
use crate::error::ConfigError;
use crate::model::SessionId;
use crate::notes::NoteService;
use crate::protocol::{ClientEvent, Frame};
use crate::registry::{JoinPolicy, SessionRegistry, DEFAULT_OUTBOX_CAPACITY};
use crate::store::{DocumentStore, MemoryStore, RocksStore, StoreConfig, TimedStore};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per session before new ones are dropped
    pub outbox_capacity: usize,
    /// Upper bound on any single store call
    pub store_timeout_ms: u64,
    /// Behaviour of JoinNote while joined to another document
    pub join_policy: JoinPolicy,
    /// Content reconstruction for InitialState / NoteChanged
    pub content_mode: ReconstructMode,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// HS256 secret shared with the token issuer. No default; empty is refused.
    pub jwt_secret: String,
    /// Clock skew tolerated on token expiry
    pub token_leeway_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            store_timeout_ms: 5000,
            join_policy: JoinPolicy::default(),
            content_mode: ReconstructMode::default(),
            storage_path: None,
            jwt_secret: String::new(),
            token_leeway_secs: DEFAULT_LEEWAY_SECS,
        }
    }
}

impl ServerConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub broadcast_frames_sent: u64,
    pub broadcast_frames_dropped: u64,
    pub active_sessions: usize,
    pub active_documents: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    store: Arc<dyn DocumentStore>,
    coordinator: Arc<SyncCoordinator>,
    notes: Arc<NoteService>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server, opening RocksDB if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        let backend: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_store(config, backend)
    }

    /// Create a server over an existing store. `storage_path` is ignored.
    pub fn with_store(config: ServerConfig, backend: Arc<dyn DocumentStore>) -> Result<Self, ConfigError> {
        let store: Arc<dyn DocumentStore> =
            Arc::new(TimedStore::new(backend, config.store_timeout()));

        let verifier =
            TokenVerifier::new(config.jwt_secret.as_bytes())?.with_leeway(config.token_leeway_secs);
        let guard = Arc::new(AuthorizationGuard::new(verifier, store.clone()));
        let registry = Arc::new(SessionRegistry::new(config.join_policy, config.outbox_capacity));
        let coordinator = Arc::new(SyncCoordinator::new(
            registry,
            guard.clone(),
            store.clone(),
            CoordinatorConfig {
                content_mode: config.content_mode,
            },
        ));
        let notes = Arc::new(NoteService::new(guard, store.clone()).with_content_mode(config.content_mode));

        Ok(Self {
            config,
            store,
            coordinator,
            notes,
            stats: Arc::new(AtomicServerStats::default()),
        })
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, coordinator, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from handshake to disconnect.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<SyncCoordinator>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (session, mut outbox) = coordinator.connect().await;
        let result = Self::pump(ws_stream, addr, session, &mut outbox, &coordinator, &stats).await;

        // Transport failures end here too; they are not reported to the client.
        coordinator.disconnect(session).await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection closed from {addr} (session {session})");
        result
    }

    async fn pump(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        session: SessionId,
        outbox: &mut mpsc::Receiver<Frame>,
        coordinator: &SyncCoordinator,
        stats: &AtomicServerStats,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.frames_in.fetch_add(1, Ordering::Relaxed);
                            Self::dispatch(coordinator, session, addr, text.as_str()).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            stats.frames_in.fetch_add(1, Ordering::Relaxed);
                            match std::str::from_utf8(&data) {
                                Ok(text) => Self::dispatch(coordinator, session, addr, text).await,
                                Err(_) => log::warn!("Dropping non-UTF-8 binary frame from {addr}"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = outbox.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::text(frame.to_string())).await?;
                            stats.frames_out.fetch_add(1, Ordering::Relaxed);
                        }
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch(coordinator: &SyncCoordinator, session: SessionId, addr: SocketAddr, text: &str) {
        match ClientEvent::decode(text) {
            Ok(event) => coordinator.handle(session, event).await,
            Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let broadcast = self.coordinator.registry().stats().await;
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_in: self.stats.frames_in.load(Ordering::Relaxed),
            frames_out: self.stats.frames_out.load(Ordering::Relaxed),
            broadcast_frames_sent: broadcast.frames_sent,
            broadcast_frames_dropped: broadcast.frames_dropped,
            active_sessions: broadcast.active_sessions,
            active_documents: broadcast.active_documents,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Request/response note operations over the same store and guard.
    pub fn notes(&self) -> &Arc<NoteService> {
        &self.notes
    }

    /// The store as seen by the server (with the timeout applied).
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}
