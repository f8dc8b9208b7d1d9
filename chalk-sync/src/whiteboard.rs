//! Per-whiteboard actor: the single writer for one whiteboard.
//!
//! ```text
//!  SessionHandle ──Command──► mailbox ──► WhiteboardActor
//!                                          ├── OperationLog::append   (durable, assigns LSN)
//!                                          ├── ConvergenceEngine::apply_committed
//!                                          └── fan-out to Session outbound buffers
//! ```
//!
//! Every command for a whiteboard is handled to completion before the next
//! one starts, so append-then-apply needs no locks. Different whiteboards
//! run on different tasks, and every store call runs on the blocking pool,
//! so a slow disk or a long replay on one whiteboard never holds up another.
//! Commands sent while the actor is still loading wait in its mailbox.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::coordinator::{CoordinatorConfig, CoordinatorError, Counters};
use crate::engine::{ConvergenceEngine, EngineError};
use crate::oplog::{Lsn, OperationLog};
use crate::protocol::{ErrorKind, Message};
use crate::session::{Delivery, Outbound, Session, SessionId};
use crate::storage::{self, Persistence, PersistenceError, Snapshot};
use crate::stroke::{Stroke, StrokeId};

/// Accepted join, returned to the coordinator.
#[derive(Debug)]
pub(crate) struct JoinAccepted {
    pub outbound: mpsc::Receiver<Outbound>,
}

/// Point-in-time view of a whiteboard.
#[derive(Debug, Clone, PartialEq)]
pub struct WhiteboardStatus {
    pub whiteboard_id: Uuid,
    pub head_lsn: Lsn,
    pub strokes: usize,
    pub digest: u64,
    pub knowledge: VectorClock,
    pub authors: BTreeSet<String>,
    pub snapshot_lsn: Lsn,
    /// Lowest LSN any live session has acknowledged applying; `None` with
    /// no sessions.
    pub min_acked_lsn: Option<Lsn>,
}

#[derive(Debug)]
pub(crate) enum Command {
    Join {
        session_id: SessionId,
        author: String,
        clock: VectorClock,
        reply: oneshot::Sender<Result<JoinAccepted, CoordinatorError>>,
    },
    Stroke {
        session_id: SessionId,
        stroke: Stroke,
    },
    Ack {
        session_id: SessionId,
        lsn: Lsn,
    },
    Heartbeat {
        session_id: SessionId,
    },
    Sync {
        session_id: SessionId,
        clock: VectorClock,
    },
    Leave {
        session_id: SessionId,
    },
    Status {
        reply: oneshot::Sender<WhiteboardStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct WhiteboardActor {
    whiteboard_id: Uuid,
    engine: ConvergenceEngine,
    log: OperationLog,
    store: Arc<dyn Persistence>,
    sessions: HashMap<SessionId, Session>,
    config: CoordinatorConfig,
    counters: Arc<Counters>,
    snapshot_lsn: Lsn,
    last_snapshot: Instant,
    /// Set by triggers; the run loop snapshots after the current command.
    snapshot_due: bool,
}

impl WhiteboardActor {
    /// Spawn the whiteboard's task and return its mailbox at once.
    ///
    /// Loading happens inside the task. If it fails, queued joins are
    /// refused and the mailbox closes, so the next join starts a fresh actor.
    pub fn spawn(
        whiteboard_id: Uuid,
        store: Arc<dyn Persistence>,
        config: CoordinatorConfig,
        counters: Arc<Counters>,
    ) -> mpsc::Sender<Command> {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        tokio::spawn(async move {
            match Self::load(whiteboard_id, store, config, counters).await {
                Ok(actor) => actor.run(rx).await,
                Err(e) => refuse_all(whiteboard_id, e.to_string(), rx).await,
            }
        });
        tx
    }

    async fn load(
        whiteboard_id: Uuid,
        store: Arc<dyn Persistence>,
        config: CoordinatorConfig,
        counters: Arc<Counters>,
    ) -> Result<Self, CoordinatorError> {
        let reader = store.clone();
        let (snapshot, log, tail) = storage::blocking(move || {
            let snapshot = reader.load_snapshot(whiteboard_id)?;
            let snapshot_lsn = snapshot.as_ref().map_or(0, |s: &Snapshot| s.lsn);
            let log = OperationLog::open(whiteboard_id, reader, snapshot_lsn)?;
            let tail = log.entries_after(snapshot_lsn)?;
            Ok((snapshot, log, tail))
        })
        .await?;
        let snapshot_lsn = snapshot.as_ref().map_or(0, |s| s.lsn);
        let engine = ConvergenceEngine::restore(
            whiteboard_id,
            snapshot,
            tail.into_iter().map(|entry| (entry.lsn, entry.stroke)),
        )?;

        log::info!(
            "Loaded whiteboard {whiteboard_id}: {} strokes, snapshot lsn {snapshot_lsn}, head lsn {}",
            engine.canvas().len(),
            log.head()
        );
        Ok(Self {
            whiteboard_id,
            engine,
            log,
            store,
            sessions: HashMap::new(),
            config,
            counters,
            snapshot_lsn,
            last_snapshot: Instant::now(),
            snapshot_due: false,
        })
    }

    async fn run(mut self, mut mailbox: mpsc::Receiver<Command>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = mailbox.recv() => {
                    let Some(command) = command else { break };
                    if let Command::Shutdown { reply } = command {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    self.handle(command).await;
                }
                _ = sweep.tick() => self.sweep(),
            }
            if self.snapshot_due {
                self.take_snapshot().await;
            }
        }
        self.shutdown().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Join {
                session_id,
                author,
                clock,
                reply,
            } => {
                let _ = reply.send(self.join(session_id, author, &clock));
            }
            Command::Stroke { session_id, stroke } => self.stroke(session_id, stroke).await,
            Command::Ack { session_id, lsn } => {
                let head = self.log.head();
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.last_acked_lsn = session.last_acked_lsn.max(lsn.min(head));
                    session.touch();
                }
            }
            Command::Heartbeat { session_id } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.touch();
                }
            }
            Command::Sync { session_id, clock } => {
                if let Some(frame) = encode(&self.catchup(&clock)) {
                    self.send_reliable(session_id, &frame);
                }
            }
            Command::Leave { session_id } => self.leave(session_id),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn join(
        &mut self,
        session_id: SessionId,
        author: String,
        clock: &VectorClock,
    ) -> Result<JoinAccepted, CoordinatorError> {
        let replaced: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.author == author)
            .map(|s| s.session_id)
            .collect();
        for old in replaced {
            if let Some(session) = self.sessions.remove(&old) {
                session.close(ErrorKind::Superseded, "a newer session for this author joined");
                self.counters.sessions.fetch_sub(1, Ordering::Relaxed);
                log::info!("Session {old} of {author} on {} superseded", self.whiteboard_id);
            }
        }

        let catchup: Arc<str> = Arc::from(self.catchup(clock).encode()?);
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(2));
        let session = Session::new(session_id, self.whiteboard_id, author.clone(), tx);
        session.deliver(&catchup);
        self.sessions.insert(session_id, session);
        self.counters.sessions.fetch_add(1, Ordering::Relaxed);

        log::info!(
            "Session {session_id}: {author} joined {} ({} live)",
            self.whiteboard_id,
            self.sessions.len()
        );
        self.broadcast_presence();
        Ok(JoinAccepted { outbound: rx })
    }

    /// Catch-up for a peer that knows `clock`.
    ///
    /// A non-empty clock this replica fully covers gets only the diverged
    /// strokes; anything else gets the full snapshot.
    fn catchup(&self, clock: &VectorClock) -> Message {
        let head = self.engine.lsn();
        if !clock.is_empty() && clock.is_dominated_by(self.engine.knowledge()) {
            let missing = self.engine.diverged(clock);
            log::debug!(
                "Causal catch-up on {}: {} strokes missing",
                self.whiteboard_id,
                missing.len()
            );
            Message::catchup(head, None, missing)
        } else {
            Message::catchup(head, self.engine.snapshot().ok(), Vec::new())
        }
    }

    async fn stroke(&mut self, session_id: SessionId, stroke: Stroke) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            log::debug!("Dropping stroke {} from departed session {session_id}", stroke.id);
            return;
        };
        session.touch();
        if stroke.author != session.author {
            let reason = format!("stroke author {} does not match session", stroke.author);
            self.reject(session_id, ErrorKind::Validation, reason, stroke.id);
            return;
        }

        match self.engine.admit(&stroke) {
            Ok(true) => {}
            Ok(false) => {
                // Resubmitted after a reconnect; it is already committed.
                let lsn = self.engine.committed_lsn(&stroke.id).unwrap_or(self.engine.lsn());
                if let Some(frame) = encode(&Message::ack(lsn, Some(stroke.id))) {
                    self.send_reliable(session_id, &frame);
                }
                return;
            }
            Err(e) => {
                let kind = match e {
                    EngineError::CausalGap { .. } => ErrorKind::CausalGap,
                    _ => ErrorKind::Validation,
                };
                self.reject(session_id, kind, e.to_string(), stroke.id);
                return;
            }
        }
        if let Err(e) = self.engine.check_dependencies(&stroke) {
            self.reject(session_id, ErrorKind::CausalGap, e.to_string(), stroke.id);
            return;
        }

        let lsn = match self.append_with_retry(&stroke).await {
            Ok(lsn) => lsn,
            Err(e) => {
                log::error!(
                    "Giving up on stroke {} for {}: {e}",
                    stroke.id,
                    self.whiteboard_id
                );
                self.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(session) = self.sessions.remove(&session_id) {
                    session.close(ErrorKind::Persistence, e.to_string());
                    self.counters.sessions.fetch_sub(1, Ordering::Relaxed);
                }
                self.broadcast_presence();
                return;
            }
        };

        let stroke_id = stroke.id;
        let frame = encode(&Message::stroke(stroke.clone(), Some(lsn)));
        if let Err(e) = self.engine.apply_committed(lsn, stroke) {
            // admit() ran the same checks against the same state.
            log::error!("Committed stroke {stroke_id} at lsn {lsn} failed to apply: {e}");
        }
        self.counters.strokes_committed.fetch_add(1, Ordering::Relaxed);

        if let Some(ack) = encode(&Message::ack(lsn, Some(stroke_id))) {
            self.send_reliable(session_id, &ack);
        }
        if let Some(frame) = frame {
            let others: Vec<SessionId> = self
                .sessions
                .keys()
                .copied()
                .filter(|id| *id != session_id)
                .collect();
            for id in others {
                self.send_reliable(id, &frame);
            }
        }

        if self.engine.strokes_since_snapshot() >= self.config.snapshot_every {
            self.snapshot_due = true;
        }
    }

    /// Write `stroke` at the next LSN, retrying with backoff.
    async fn append_with_retry(&mut self, stroke: &Stroke) -> Result<Lsn, CoordinatorError> {
        let lsn = self.log.next_lsn();
        let mut attempt = 0;
        loop {
            let store = self.store.clone();
            let entry = stroke.clone();
            let whiteboard_id = self.whiteboard_id;
            let written =
                storage::blocking(move || store.append_log_entry(whiteboard_id, &entry, lsn)).await;
            match written {
                Ok(()) => {
                    self.log.record(lsn, stroke.clone())?;
                    return Ok(lsn);
                }
                Err(e) if attempt < self.config.append_retries => {
                    let delay = backoff(self.config.retry_backoff, attempt);
                    log::warn!(
                        "Append to {} failed (attempt {}): {e}; retrying in {delay:?}",
                        self.whiteboard_id,
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn reject(&mut self, session_id: SessionId, kind: ErrorKind, reason: String, stroke_id: StrokeId) {
        log::warn!(
            "Rejected stroke {stroke_id} on {} from session {session_id}: {reason}",
            self.whiteboard_id
        );
        self.counters.strokes_rejected.fetch_add(1, Ordering::Relaxed);
        if let Some(frame) = encode(&Message::rejected(kind, reason, stroke_id)) {
            self.send_reliable(session_id, &frame);
        }
    }

    /// Deliver a frame that must not be lost. A session that cannot take it
    /// is torn down and must rejoin.
    fn send_reliable(&mut self, session_id: SessionId, frame: &Arc<str>) {
        let Some(session) = self.sessions.get(&session_id) else { return };
        match session.deliver(frame) {
            Delivery::Sent => {}
            Delivery::Full => {
                log::warn!(
                    "Session {session_id} ({}) on {} fell behind; forcing resync",
                    session.author,
                    self.whiteboard_id
                );
                self.counters.forced_resyncs.fetch_add(1, Ordering::Relaxed);
                self.drop_session(session_id);
            }
            Delivery::Gone => self.drop_session(session_id),
        }
    }

    fn drop_session(&mut self, session_id: SessionId) {
        if self.sessions.remove(&session_id).is_some() {
            self.counters.sessions.fetch_sub(1, Ordering::Relaxed);
            self.after_departure();
        }
    }

    fn leave(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.remove(&session_id) else { return };
        self.counters.sessions.fetch_sub(1, Ordering::Relaxed);
        log::info!(
            "Session {session_id}: {} left {} ({} live)",
            session.author,
            self.whiteboard_id,
            self.sessions.len()
        );
        if let Some(frame) = encode(&Message::leave(session.author.clone())) {
            for s in self.sessions.values() {
                s.deliver(&frame);
            }
        }
        self.after_departure();
    }

    fn after_departure(&mut self) {
        self.broadcast_presence();
        if self.sessions.is_empty() && self.engine.strokes_since_snapshot() > 0 {
            self.snapshot_due = true;
        }
    }

    /// Presence is advisory: full buffers skip it.
    fn broadcast_presence(&mut self) {
        let authors: BTreeSet<String> = self.sessions.values().map(|s| s.author.clone()).collect();
        let Some(frame) = encode(&Message::presence(self.whiteboard_id, authors)) else { return };

        let mut gone = Vec::new();
        for session in self.sessions.values() {
            match session.deliver(&frame) {
                Delivery::Sent => {}
                Delivery::Full => {
                    log::debug!("Presence to session {} dropped (buffer full)", session.session_id);
                    self.counters.presence_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Gone => gone.push(session.session_id),
            }
        }
        for id in gone {
            if self.sessions.remove(&id).is_some() {
                self.counters.sessions.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    fn sweep(&mut self) {
        let timeout = self.config.heartbeat_timeout;
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.last_heartbeat.elapsed() > timeout)
            .map(|s| s.session_id)
            .collect();
        if !expired.is_empty() {
            for id in expired {
                if let Some(session) = self.sessions.remove(&id) {
                    log::info!(
                        "Session {id} ({}) on {} timed out after {timeout:?}",
                        session.author,
                        session.whiteboard_id
                    );
                    session.close(ErrorKind::Timeout, "heartbeat timeout");
                    self.counters.sessions.fetch_sub(1, Ordering::Relaxed);
                }
            }
            self.after_departure();
        }

        if self.engine.strokes_since_snapshot() > 0
            && self.last_snapshot.elapsed() >= self.config.snapshot_interval
        {
            self.snapshot_due = true;
        }
    }

    /// Failures are logged; the next trigger retries.
    async fn take_snapshot(&mut self) {
        self.snapshot_due = false;
        let snapshot = match self.engine.snapshot() {
            Ok(s) => s,
            Err(e) => {
                log::error!("Cannot snapshot {}: {e}", self.whiteboard_id);
                return;
            }
        };
        let lsn = snapshot.lsn;
        let strokes = snapshot.strokes.len();
        let store = self.store.clone();
        let whiteboard_id = self.whiteboard_id;
        match storage::blocking(move || store.save_snapshot(whiteboard_id, &snapshot)).await {
            Ok(()) => {
                self.engine.mark_snapshot();
                self.log.truncate_cache(lsn);
                self.snapshot_lsn = lsn;
                self.last_snapshot = Instant::now();
                self.counters.snapshots_taken.fetch_add(1, Ordering::Relaxed);
                log::info!("Snapshot of {whiteboard_id} at lsn {lsn} ({strokes} strokes)");
            }
            Err(e) => {
                // Keep the interval from retrying every tick.
                self.last_snapshot = Instant::now();
                log::error!("Snapshot of {whiteboard_id} at lsn {lsn} failed: {e}");
            }
        }
    }

    fn status(&self) -> WhiteboardStatus {
        WhiteboardStatus {
            whiteboard_id: self.whiteboard_id,
            head_lsn: self.log.head(),
            strokes: self.engine.canvas().len(),
            digest: self.engine.canvas().digest(),
            knowledge: self.engine.knowledge().clone(),
            authors: self.sessions.values().map(|s| s.author.clone()).collect(),
            snapshot_lsn: self.snapshot_lsn,
            min_acked_lsn: self.sessions.values().map(|s| s.last_acked_lsn).min(),
        }
    }

    async fn shutdown(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.close(ErrorKind::Shutdown, "server shutting down");
            self.counters.sessions.fetch_sub(1, Ordering::Relaxed);
        }
        if self.engine.strokes_since_snapshot() > 0 {
            self.take_snapshot().await;
        }
        log::info!("Whiteboard {} stopped at lsn {}", self.whiteboard_id, self.log.head());
    }
}

/// Answer everything queued for a whiteboard that failed to load.
async fn refuse_all(whiteboard_id: Uuid, reason: String, mut mailbox: mpsc::Receiver<Command>) {
    log::error!("Failed to load whiteboard {whiteboard_id}: {reason}");
    mailbox.close();
    while let Some(command) = mailbox.recv().await {
        match command {
            Command::Join { reply, .. } => {
                let error =
                    PersistenceError::Unavailable(format!("whiteboard {whiteboard_id} failed to load: {reason}"));
                let _ = reply.send(Err(CoordinatorError::Persistence(error)));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
            _ => {}
        }
    }
}

fn encode(message: &Message) -> Option<Arc<str>> {
    match message.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            log::error!("Failed to encode {} frame: {e}", message.kind());
            None
        }
    }
}

/// Delay before retry number `attempt` (0-based).
pub(crate) fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}
