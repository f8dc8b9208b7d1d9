//! WebSocket sync client holding a local replica of one whiteboard.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect after a resync)
//! - Optimistic local strokes, resent until the server acknowledges them
//! - Remote strokes merged through the local convergence engine
//! - Offline queue for strokes drawn while disconnected
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::canvas::CanvasDelta;
use crate::clock::VectorClock;
use crate::engine::{ApplyOutcome, ConvergenceEngine, EngineError};
use crate::oplog::Lsn;
use crate::protocol::{Catchup, ErrorKind, Message, ProtocolError, StrokeMsg};
use crate::stroke::{Color, Point, Stroke, StrokeId, Tool};
use crate::whiteboard::backoff;

type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Socket open, waiting for the join catch-up.
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Catch-up applied; the replica is live. `reset` means the canvas was
    /// replaced by a server snapshot and should be redrawn in full.
    Synced {
        head_lsn: Lsn,
        reset: bool,
        deltas: Vec<CanvasDelta>,
    },
    /// A remote stroke changed the canvas.
    RemoteStroke(CanvasDelta),
    /// The server committed one of our strokes.
    Acked { lsn: Lsn, stroke_id: Option<StrokeId> },
    Presence(BTreeSet<String>),
    AuthorLeft(String),
    ServerError { kind: ErrorKind, message: String },
    Disconnected { reason: Option<ErrorKind> },
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
    #[error("offline queue is full")]
    QueueFull,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port`
    pub server_url: String,
    pub whiteboard_id: Uuid,
    pub author: String,
    pub heartbeat_interval: Duration,
    /// Strokes held until acknowledged, online or not.
    pub max_pending: usize,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, whiteboard_id: Uuid, author: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            whiteboard_id,
            author: author.into(),
            heartbeat_interval: Duration::from_secs(10),
            max_pending: 10_000,
            auto_reconnect: true,
            reconnect_delay: Duration::from_millis(250),
            max_reconnect_attempts: 8,
        }
    }
}

/// Own strokes not yet acknowledged by the server.
///
/// Strokes drawn offline wait here and are replayed on reconnection; strokes
/// sent while online stay until their ACK arrives so a dropped connection
/// cannot lose them.
pub struct OfflineQueue {
    queue: VecDeque<Stroke>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a stroke. Returns false when full.
    pub fn enqueue(&mut self, stroke: Stroke) -> bool {
        if self.is_full() {
            return false;
        }
        self.queue.push_back(stroke);
        true
    }

    /// Remove an acknowledged stroke.
    pub fn acknowledge(&mut self, stroke_id: &StrokeId) -> bool {
        self.remove(stroke_id).is_some()
    }

    /// Take a stroke out of the queue, acknowledged or not.
    pub fn remove(&mut self, stroke_id: &StrokeId) -> Option<Stroke> {
        let index = self.queue.iter().position(|s| &s.id == stroke_id)?;
        self.queue.remove(index)
    }

    /// Empty the queue, returning its strokes in submission order.
    pub fn drain(&mut self) -> Vec<Stroke> {
        self.queue.drain(..).collect()
    }

    /// Oldest unacknowledged stroke.
    pub fn front(&self) -> Option<&Stroke> {
        self.queue.front()
    }

    /// Queued strokes in submission order.
    pub fn strokes(&self) -> impl Iterator<Item = &Stroke> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total points queued.
    pub fn total_points(&self) -> usize {
        self.queue.iter().map(|s| s.points.len()).sum()
    }
}

/// Whether a connection that ended for `reason` should be retried.
fn should_reconnect(reason: Option<&ErrorKind>) -> bool {
    match reason {
        None => true,
        Some(kind) => matches!(
            kind,
            ErrorKind::Resync
                | ErrorKind::Persistence
                | ErrorKind::Timeout
                | ErrorKind::Shutdown
                | ErrorKind::NotJoined
        ),
    }
}

enum Flow {
    Continue,
    Stop(Option<ErrorKind>),
}

struct Replica {
    state: ConnectionState,
    engine: ConvergenceEngine,
    pending: OfflineQueue,
    last_lsn: Lsn,
    outgoing: Option<mpsc::Sender<String>>,
    /// Bumped per connection so tasks of an old socket retire.
    generation: u64,
}

impl Replica {
    async fn send(&self, message: &Message) -> Result<(), ClientError> {
        let tx = self.outgoing.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(message.encode()?)
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Knowledge to announce on join: everything applied, except that our
    /// own counter stops before the oldest unacknowledged stroke.
    fn join_clock(&self, author: &str) -> VectorClock {
        let mut clock = self.engine.knowledge().clone();
        if let Some(oldest) = self.pending.front() {
            clock.set(author, oldest.own_counter().saturating_sub(1));
        }
        clock
    }

    fn apply_catchup(&mut self, catchup: Catchup) -> Result<SyncEvent, EngineError> {
        let whiteboard_id = self.engine.whiteboard_id();
        let mut deltas = Vec::new();
        let reset = catchup.snapshot.is_some();

        if let Some(snapshot) = catchup.snapshot {
            self.engine = ConvergenceEngine::restore(whiteboard_id, Some(snapshot), Vec::new())?;
        }
        for stroke in catchup.strokes {
            let id = stroke.id;
            match self.engine.apply(stroke) {
                Ok(ApplyOutcome::Applied(delta)) => deltas.push(delta),
                Ok(_) => {}
                Err(e) => log::warn!("Skipping catch-up stroke {id}: {e}"),
            }
        }
        if reset {
            self.rebase_pending(&mut deltas);
        }
        self.last_lsn = self.last_lsn.max(catchup.head_lsn);

        Ok(SyncEvent::Synced {
            head_lsn: catchup.head_lsn,
            reset,
            deltas,
        })
    }

    /// Re-apply unacknowledged strokes over a freshly restored snapshot.
    ///
    /// Strokes the snapshot already holds were committed and leave the
    /// queue. The rest get their author's counter renumbered to follow the
    /// last committed one, so a stroke the server refused leaves no gap.
    fn rebase_pending(&mut self, deltas: &mut Vec<CanvasDelta>) {
        for mut stroke in self.pending.drain() {
            if self.engine.canvas().contains(&stroke.id) {
                continue;
            }
            let next = self.engine.knowledge().get(&stroke.author) + 1;
            if stroke.own_counter() != next {
                log::debug!(
                    "Renumbering pending stroke {} from {} to {next}",
                    stroke.id,
                    stroke.own_counter()
                );
                let author = stroke.author.clone();
                stroke.vector_clock.set(author, next);
            }
            match self.engine.apply(stroke.clone()) {
                Ok(outcome) => {
                    if let ApplyOutcome::Applied(delta) = outcome {
                        deltas.push(delta);
                    }
                    self.pending.enqueue(stroke);
                }
                Err(e) => log::warn!("Dropping pending stroke {}: {e}", stroke.id),
            }
        }
    }
}

struct Shared {
    config: ClientConfig,
    replica: Mutex<Replica>,
    event_tx: mpsc::Sender<SyncEvent>,
    /// Set by `disconnect`; suppresses reconnection.
    closed: AtomicBool,
}

impl Shared {
    async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        {
            let mut replica = self.replica.lock().await;
            if replica.outgoing.is_some() {
                return Ok(());
            }
            if replica.state == ConnectionState::Disconnected {
                replica.state = ConnectionState::Connecting;
            }
        }

        let ws_stream = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                let mut replica = self.replica.lock().await;
                if replica.state == ConnectionState::Connecting {
                    replica.state = ConnectionState::Disconnected;
                }
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(WsMessage::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let generation = {
            let mut replica = self.replica.lock().await;
            replica.generation += 1;
            replica.outgoing = Some(out_tx);
            replica.state = ConnectionState::Connecting;
            let clock = replica.join_clock(&self.config.author);
            let join = Message::join(self.config.whiteboard_id, self.config.author.clone(), clock);
            replica.send(&join).await?;
            replica.generation
        };
        log::info!(
            "Connected to {} as {} on {}",
            self.config.server_url,
            self.config.author,
            self.config.whiteboard_id
        );

        tokio::spawn(self.clone().read_loop(ws_reader, generation));
        self.spawn_heartbeat(generation);
        Ok(())
    }

    fn spawn_heartbeat(self: &Arc<Self>, generation: u64) {
        let shared = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let replica = shared.replica.lock().await;
                if replica.generation != generation {
                    break;
                }
                if replica.send(&Message::Heartbeat).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn read_loop(self: Arc<Self>, mut ws_reader: WsSource, generation: u64) {
        let mut reason = None;
        while let Some(frame) = ws_reader.next().await {
            let bytes: &[u8] = match &frame {
                Ok(WsMessage::Text(text)) => text.as_str().as_bytes(),
                Ok(WsMessage::Binary(data)) => &data[..],
                Ok(WsMessage::Close(_)) | Err(_) => break,
                _ => continue,
            };
            let message = match Message::decode(bytes) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("Ignoring undecodable frame from server: {e}");
                    continue;
                }
            };
            let (events, flow) = self.handle_message(message, generation).await;
            for event in events {
                self.emit(event);
            }
            if let Flow::Stop(kind) = flow {
                reason = kind;
                break;
            }
        }
        self.on_disconnect(generation, reason).await;
    }

    async fn handle_message(&self, message: Message, generation: u64) -> (Vec<SyncEvent>, Flow) {
        let mut replica = self.replica.lock().await;
        if replica.generation != generation {
            return (Vec::new(), Flow::Stop(None));
        }
        let mut events = Vec::new();

        match message {
            Message::Catchup(catchup) => match replica.apply_catchup(catchup) {
                Ok(event) => {
                    replica.state = ConnectionState::Connected;
                    let _ = replica.send(&Message::ack(replica.last_lsn, None)).await;
                    let resend: Vec<Stroke> = replica.pending.strokes().cloned().collect();
                    if !resend.is_empty() {
                        log::info!("Replaying {} unacknowledged strokes", resend.len());
                    }
                    for stroke in resend {
                        if replica.send(&Message::stroke(stroke, None)).await.is_err() {
                            break;
                        }
                    }
                    events.push(event);
                }
                Err(e) => {
                    log::error!("Catch-up for {} failed: {e}", self.config.whiteboard_id);
                    return (events, Flow::Stop(None));
                }
            },
            Message::Stroke(StrokeMsg { stroke, lsn }) => {
                let id = stroke.id;
                let outcome = match lsn {
                    Some(lsn) => replica.engine.apply_committed(lsn, stroke),
                    None => replica.engine.apply(stroke),
                };
                match outcome {
                    Ok(ApplyOutcome::Applied(delta)) => events.push(SyncEvent::RemoteStroke(delta)),
                    Ok(_) => {}
                    Err(EngineError::CausalGap { author, expected, got }) => {
                        log::debug!("Gap on {author} (expected {expected}, got {got}); requesting sync");
                        let clock = replica.engine.knowledge().clone();
                        let _ = replica.send(&Message::sync(clock)).await;
                        return (events, Flow::Continue);
                    }
                    Err(e) => log::warn!("Rejected remote stroke {id}: {e}"),
                }
                if let Some(lsn) = lsn {
                    replica.last_lsn = replica.last_lsn.max(lsn);
                    let _ = replica.send(&Message::ack(lsn, None)).await;
                }
            }
            Message::Ack(ack) => {
                if let Some(id) = &ack.stroke_id {
                    replica.pending.acknowledge(id);
                }
                replica.last_lsn = replica.last_lsn.max(ack.lsn);
                events.push(SyncEvent::Acked {
                    lsn: ack.lsn,
                    stroke_id: ack.stroke_id,
                });
            }
            Message::Presence(presence) => events.push(SyncEvent::Presence(presence.authors)),
            Message::Leave(leave) => events.push(SyncEvent::AuthorLeft(leave.author)),
            Message::Error(error) => {
                log::warn!("Server error ({}): {}", error.kind, error.message);
                events.push(SyncEvent::ServerError {
                    kind: error.kind.clone(),
                    message: error.message,
                });
                match error.kind {
                    ErrorKind::CausalGap => {
                        let clock = replica.engine.knowledge().clone();
                        let _ = replica.send(&Message::sync(clock)).await;
                    }
                    ErrorKind::Validation => {
                        // The refused stroke is on the optimistic canvas only.
                        // Drop it and rebuild from a full snapshot.
                        let refused = error.stroke_id.and_then(|id| replica.pending.remove(&id));
                        if let Some(stroke) = refused {
                            log::warn!("Server refused stroke {}; resyncing from snapshot", stroke.id);
                            let _ = replica.send(&Message::sync(VectorClock::new())).await;
                        }
                    }
                    kind => return (events, Flow::Stop(Some(kind))),
                }
            }
            Message::Unknown(kind) => log::debug!("Ignoring unknown frame kind '{kind}'"),
            Message::Join(_) | Message::Sync(_) | Message::Heartbeat => {}
        }
        (events, Flow::Continue)
    }

    async fn on_disconnect(self: Arc<Self>, generation: u64, reason: Option<ErrorKind>) {
        let reconnect = {
            let mut replica = self.replica.lock().await;
            if replica.generation != generation {
                return;
            }
            replica.outgoing = None;
            replica.state = ConnectionState::Disconnected;
            !self.closed.load(Ordering::Acquire)
                && self.config.auto_reconnect
                && should_reconnect(reason.as_ref())
        };
        log::info!("Disconnected from {} ({reason:?})", self.config.server_url);
        self.emit(SyncEvent::Disconnected { reason });
        if reconnect {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: Arc<Self>) {
        tokio::spawn(async move {
            for attempt in 0..self.config.max_reconnect_attempts {
                if self.closed.load(Ordering::Acquire) {
                    return;
                }
                self.replica.lock().await.state = ConnectionState::Reconnecting;
                tokio::time::sleep(backoff(self.config.reconnect_delay, attempt)).await;
                match self.connect().await {
                    Ok(()) => return,
                    Err(e) => log::warn!("Reconnect attempt {} failed: {e}", attempt + 1),
                }
            }
            log::error!(
                "Giving up on {} after {} attempts",
                self.config.server_url,
                self.config.max_reconnect_attempts
            );
            self.replica.lock().await.state = ConnectionState::Disconnected;
        });
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::debug!("Dropping sync event: {e}");
        }
    }
}

/// The sync client.
///
/// Keeps a full replica of one whiteboard and exchanges strokes with the
/// server. Events arrive on the receiver from [`SyncClient::take_event_rx`];
/// events are dropped while that receiver is full.
pub struct SyncClient {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let replica = Replica {
            state: ConnectionState::Disconnected,
            engine: ConvergenceEngine::ready(config.whiteboard_id),
            pending: OfflineQueue::new(config.max_pending),
            last_lsn: 0,
            outgoing: None,
            generation: 0,
        };
        Self {
            shared: Arc::new(Shared {
                config,
                replica: Mutex::new(replica),
                event_tx,
                closed: AtomicBool::new(false),
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join. The replica goes live once the catch-up arrives.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.shared.closed.store(false, Ordering::Release);
        self.shared.connect().await
    }

    /// Leave the whiteboard and close the connection. Does not reconnect.
    pub async fn disconnect(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let was_open = {
            let mut replica = self.shared.replica.lock().await;
            let _ = replica
                .send(&Message::leave(self.shared.config.author.clone()))
                .await;
            replica.generation += 1;
            replica.state = ConnectionState::Disconnected;
            replica.outgoing.take().is_some()
        };
        if was_open {
            self.shared.emit(SyncEvent::Disconnected { reason: None });
        }
    }

    /// Draw a stroke: applied locally at once, sent when connected, and
    /// held until the server acknowledges it.
    pub async fn submit_stroke(
        &self,
        points: Vec<Point>,
        color: Color,
        width: f32,
        tool: Tool,
    ) -> Result<Stroke, ClientError> {
        let config = &self.shared.config;
        let mut replica = self.shared.replica.lock().await;
        if replica.pending.is_full() {
            return Err(ClientError::QueueFull);
        }

        let mut clock = replica.engine.knowledge().clone();
        clock.increment(&config.author);
        let stroke = Stroke::new(
            config.whiteboard_id,
            config.author.clone(),
            points,
            color,
            width,
            tool,
            clock,
        );
        replica.engine.apply(stroke.clone())?;
        replica.pending.enqueue(stroke.clone());

        // While connecting, the catch-up handler replays the queue.
        if replica.state == ConnectionState::Connected {
            if let Err(e) = replica.send(&Message::stroke(stroke.clone(), None)).await {
                log::debug!("Stroke {} stays queued: {e}", stroke.id);
            }
        }
        Ok(stroke)
    }

    /// Ask the server for anything this replica is missing.
    pub async fn request_sync(&self) -> Result<(), ClientError> {
        let replica = self.shared.replica.lock().await;
        let clock = replica.engine.knowledge().clone();
        replica.send(&Message::sync(clock)).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.replica.lock().await.state
    }

    /// Highest own counter applied per author.
    pub async fn knowledge(&self) -> VectorClock {
        self.shared.replica.lock().await.engine.knowledge().clone()
    }

    /// Strokes in paint order.
    pub async fn strokes(&self) -> Vec<Stroke> {
        let replica = self.shared.replica.lock().await;
        replica.engine.canvas().strokes().cloned().collect()
    }

    pub async fn stroke_count(&self) -> usize {
        self.shared.replica.lock().await.engine.canvas().len()
    }

    /// Canvas digest; equal digests mean identical canvases.
    pub async fn canvas_digest(&self) -> u64 {
        self.shared.replica.lock().await.engine.canvas().digest()
    }

    /// Highest LSN seen from the server.
    pub async fn last_lsn(&self) -> Lsn {
        self.shared.replica.lock().await.last_lsn
    }

    /// Strokes not yet acknowledged.
    pub async fn pending_len(&self) -> usize {
        self.shared.replica.lock().await.pending.len()
    }

    pub fn whiteboard_id(&self) -> Uuid {
        self.shared.config.whiteboard_id
    }

    pub fn author(&self) -> &str {
        &self.shared.config.author
    }

    pub fn server_url(&self) -> &str {
        &self.shared.config.server_url
    }
}
