//! WebSocket transport for the session coordinator.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── WhiteboardActor (wb 1) ── OperationLog ──┐
//!             ├── handle_connection ──► │                                            ├── Persistence
//! Client B ──┘   (one task per socket)  └── WhiteboardActor (wb 2) ── OperationLog ──┘   (RocksDB / memory)
//! ```
//!
//! A connection must open with a `join` frame. After that its task relays
//! client frames to the session handle and writes whatever the coordinator
//! queues for it. Malformed frames close the connection without touching any
//! whiteboard.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 8

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::coordinator::{Coordinator, CoordinatorConfig, CoordinatorError};
use crate::membership::{Membership, OpenMembership};
use crate::protocol::{ErrorKind, Join, Message, ProtocolError};
use crate::session::Outbound;
use crate::storage::{MemoryStore, Persistence, PersistenceError, RocksStore, StoreConfig};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// RocksDB block cache size in bytes
    pub block_cache_size: usize,
    /// fsync every log append
    pub sync_writes: bool,
    /// Largest accepted frame in bytes
    pub max_frame_bytes: usize,
    /// Time a new connection has to send `join`
    pub join_timeout: Duration,
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            block_cache_size: store.block_cache_size,
            sync_writes: store.sync_writes,
            max_frame_bytes: 1024 * 1024,
            join_timeout: Duration::from_secs(10),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory store, fast timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            join_timeout: Duration::from_secs(2),
            coordinator: CoordinatorConfig::for_testing(),
            ..Self::default()
        }
    }

    fn store_config(&self, path: PathBuf) -> StoreConfig {
        StoreConfig {
            path,
            block_cache_size: self.block_cache_size,
            sync_writes: self.sync_writes,
            ..StoreConfig::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub protocol_errors: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    protocol_errors: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    coordinator: Coordinator,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Open the configured store and build a server that admits any author.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn Persistence> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(config.store_config(path.clone()))?),
            None => {
                log::warn!("No storage path configured; whiteboards live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_parts(config, store, Arc::new(OpenMembership)))
    }

    pub fn with_parts(
        config: ServerConfig,
        store: Arc<dyn Persistence>,
        membership: Arc<dyn Membership>,
    ) -> Self {
        let coordinator = Coordinator::new(store, membership, config.coordinator.clone());
        Self {
            config,
            coordinator,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Recover persisted whiteboards, bind, and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let recovered = self.coordinator.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} whiteboards from persistent storage");
        }
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
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

    /// Close every session and take final snapshots.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (sink, source) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut conn = Connection {
            sink,
            source,
            addr,
            stats: self.stats.clone(),
            max_frame_bytes: self.config.max_frame_bytes,
        };
        let result = self.drive(&mut conn).await;

        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection closed from {addr}");
        result
    }

    async fn drive(&self, conn: &mut Connection) -> Result<(), BoxError> {
        let Some(join) = self.await_join(conn).await? else {
            return Ok(());
        };
        let mut handle = match self.coordinator.join(join).await {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("Join from {} refused: {e}", conn.addr);
                conn.close_with(e.kind(), e.to_string()).await;
                return Ok(());
            }
        };
        log::debug!(
            "{} bound to session {} on {}",
            conn.addr,
            handle.session_id(),
            handle.whiteboard_id()
        );

        let mut leaving = false;
        loop {
            tokio::select! {
                incoming = conn.read() => match incoming {
                    Ok(Incoming::Message(msg)) => match msg {
                        Message::Stroke(body) => handle.submit(body.stroke).await?,
                        Message::Ack(body) => handle.ack(body.lsn).await?,
                        Message::Heartbeat => handle.heartbeat().await?,
                        Message::Sync(body) => handle.sync(body.clock).await?,
                        Message::Leave(_) => {
                            leaving = true;
                            break;
                        }
                        Message::Join(_) => {
                            conn.close_with(ErrorKind::Protocol, "already joined").await;
                            break;
                        }
                        Message::Unknown(kind) => {
                            log::debug!("Ignoring unknown frame kind '{kind}' from {}", conn.addr);
                        }
                        other => {
                            log::debug!("Ignoring server-bound '{}' frame from {}", other.kind(), conn.addr);
                        }
                    },
                    Ok(Incoming::Skip) => {}
                    Ok(Incoming::Closed) => break,
                    Err(e) => {
                        conn.protocol_error(e).await;
                        break;
                    }
                },
                outbound = handle.recv() => match outbound {
                    Some(Outbound::Frame(frame)) => conn.send_text(frame.as_ref()).await?,
                    Some(Outbound::Close(kind, message)) => {
                        conn.close_with(kind, message).await;
                        break;
                    }
                    None => {
                        log::warn!("Session for {} was dropped; requesting resync", conn.addr);
                        conn.close_with(ErrorKind::Resync, "session dropped; rejoin to catch up").await;
                        break;
                    }
                },
            }
        }

        if leaving {
            handle.leave().await?;
            let _ = conn.sink.send(WsMessage::Close(None)).await;
        }
        Ok(())
    }

    /// Wait for the opening `join`. `None` means the connection ended first.
    async fn await_join(&self, conn: &mut Connection) -> Result<Option<Join>, BoxError> {
        loop {
            let incoming = match tokio::time::timeout(self.config.join_timeout, conn.read()).await {
                Ok(incoming) => incoming,
                Err(_) => {
                    conn.protocol_error(ProtocolError::Timeout).await;
                    return Ok(None);
                }
            };
            match incoming {
                Ok(Incoming::Message(Message::Join(join))) => return Ok(Some(join)),
                Ok(Incoming::Message(Message::Heartbeat)) | Ok(Incoming::Skip) => {}
                Ok(Incoming::Message(Message::Unknown(kind))) => {
                    log::debug!("Ignoring unknown frame kind '{kind}' from {}", conn.addr);
                }
                Ok(Incoming::Message(other)) => {
                    let reason = format!("'{}' before join", other.kind());
                    conn.send(&Message::error(ErrorKind::NotJoined, reason)).await?;
                }
                Ok(Incoming::Closed) => return Ok(None),
                Err(e) => {
                    conn.protocol_error(e).await;
                    return Ok(None);
                }
            }
        }
    }
}

enum Incoming {
    Message(Message),
    /// Control frame already handled.
    Skip,
    Closed,
}

struct Connection {
    sink: WsSink,
    source: WsSource,
    addr: SocketAddr,
    stats: Arc<AtomicServerStats>,
    max_frame_bytes: usize,
}

impl Connection {
    async fn read(&mut self) -> Result<Incoming, ProtocolError> {
        let raw = match self.source.next().await {
            None | Some(Ok(WsMessage::Close(_))) => return Ok(Incoming::Closed),
            Some(Err(e)) => {
                log::debug!("WebSocket error from {}: {e}", self.addr);
                return Ok(Incoming::Closed);
            }
            Some(Ok(raw)) => raw,
        };
        let bytes: &[u8] = match &raw {
            WsMessage::Text(text) => text.as_str().as_bytes(),
            WsMessage::Binary(data) => &data[..],
            WsMessage::Ping(data) => {
                let _ = self.sink.send(WsMessage::Pong(data.clone())).await;
                return Ok(Incoming::Skip);
            }
            _ => return Ok(Incoming::Skip),
        };
        if bytes.len() > self.max_frame_bytes {
            return Err(ProtocolError::Malformed(format!(
                "frame of {} bytes exceeds limit of {}",
                bytes.len(),
                self.max_frame_bytes
            )));
        }
        self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_in.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Message::decode(bytes).map(Incoming::Message)
    }

    async fn send(&mut self, message: &Message) -> Result<(), BoxError> {
        let text = message.encode()?;
        self.send_text(&text).await
    }

    async fn send_text(&mut self, text: &str) -> Result<(), BoxError> {
        self.sink.send(WsMessage::text(text.to_string())).await?;
        self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send an `error` frame and close; the peer may already be gone.
    async fn close_with(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let _ = self.send(&Message::error(kind, message)).await;
        let _ = self.sink.send(WsMessage::Close(None)).await;
    }

    async fn protocol_error(&mut self, e: ProtocolError) {
        log::warn!("Protocol error from {}: {e}", self.addr);
        self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
        self.close_with(ErrorKind::Protocol, e.to_string()).await;
    }
}
