//! Session coordinator: routes sessions to per-whiteboard actors.
//!
//! The coordinator owns no canvas state. It authenticates joins, starts a
//! [`WhiteboardActor`](crate::whiteboard) the first time a whiteboard is
//! touched, and hands the connection a [`SessionHandle`] bound to that
//! actor's mailbox. Actors stay resident until shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::engine::EngineError;
use crate::membership::Membership;
use crate::protocol::{ErrorKind, Join, ProtocolError};
use crate::session::SessionHandle;
use crate::storage::{self, Persistence, PersistenceError};
use crate::whiteboard::{Command, WhiteboardActor, WhiteboardStatus};

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Commands buffered per whiteboard actor
    pub mailbox_capacity: usize,
    /// Frames buffered per session before backpressure applies
    pub outbound_buffer: usize,
    /// Sessions silent for longer than this are dropped
    pub heartbeat_timeout: Duration,
    /// How often actors check heartbeats and the snapshot timer
    pub sweep_interval: Duration,
    /// Snapshot after this many applied strokes
    pub snapshot_every: u64,
    /// Snapshot at least this often while strokes are arriving
    pub snapshot_interval: Duration,
    /// Append retries after the first failure
    pub append_retries: u32,
    /// First retry delay; doubles per attempt
    pub retry_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
            outbound_buffer: 256,
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            snapshot_every: 100,
            snapshot_interval: Duration::from_secs(60),
            append_retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl CoordinatorConfig {
    /// Fast timers for tests.
    pub fn for_testing() -> Self {
        Self {
            sweep_interval: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(1),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("whiteboard {0} does not exist")]
    WhiteboardNotFound(Uuid),
    #[error("author could not be authenticated")]
    Unauthorized,
    #[error("session has not joined a whiteboard")]
    NotJoined,
    #[error("coordinator is shutting down")]
    Shutdown,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CoordinatorError {
    /// Wire category reported to the client.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::WhiteboardNotFound(_) => ErrorKind::NotFound,
            CoordinatorError::Unauthorized => ErrorKind::Unauthorized,
            CoordinatorError::NotJoined => ErrorKind::NotJoined,
            CoordinatorError::Shutdown => ErrorKind::Shutdown,
            CoordinatorError::Persistence(_) => ErrorKind::Persistence,
            CoordinatorError::Engine(EngineError::CausalGap { .. }) => ErrorKind::CausalGap,
            CoordinatorError::Engine(_) => ErrorKind::Validation,
            CoordinatorError::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

/// Coordinator statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorStats {
    pub whiteboards: usize,
    pub sessions: u64,
    pub strokes_committed: u64,
    pub strokes_rejected: u64,
    pub presence_dropped: u64,
    pub forced_resyncs: u64,
    pub snapshots_taken: u64,
    pub persistence_failures: u64,
}

/// Lock-free counters shared with every actor.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub sessions: AtomicU64,
    pub strokes_committed: AtomicU64,
    pub strokes_rejected: AtomicU64,
    pub presence_dropped: AtomicU64,
    pub forced_resyncs: AtomicU64,
    pub snapshots_taken: AtomicU64,
    pub persistence_failures: AtomicU64,
}

struct Inner {
    store: Arc<dyn Persistence>,
    membership: Arc<dyn Membership>,
    config: CoordinatorConfig,
    actors: RwLock<HashMap<Uuid, mpsc::Sender<Command>>>,
    counters: Arc<Counters>,
    next_session: AtomicU64,
}

/// Cheap to clone; clones share the same actors.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Persistence>,
        membership: Arc<dyn Membership>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                membership,
                config,
                actors: RwLock::new(HashMap::new()),
                counters: Arc::new(Counters::default()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Start an actor for every persisted whiteboard and wait until each
    /// has loaded. Returns how many loaded; failures are logged and retried
    /// on the next join.
    pub async fn recover(&self) -> Result<usize, CoordinatorError> {
        let store = self.inner.store.clone();
        let ids = storage::blocking(move || store.list_whiteboards()).await?;
        for id in &ids {
            self.actor(*id).await;
        }

        let mut loaded = 0;
        for id in &ids {
            // Answered once loading finishes; a failed load closes the mailbox.
            match self.whiteboard_status(*id).await {
                Some(_) => loaded += 1,
                None => log::error!("Whiteboard {id} could not be recovered"),
            }
        }
        log::info!("Recovery complete: {loaded} of {} whiteboards loaded", ids.len());
        Ok(loaded)
    }

    /// Open a session for `join.author` on `join.whiteboard_id`.
    ///
    /// The first frame on the returned handle is the catch-up.
    pub async fn join(&self, join: Join) -> Result<SessionHandle, CoordinatorError> {
        let author = self
            .inner
            .membership
            .authenticate(&join.author)
            .ok_or(CoordinatorError::Unauthorized)?;
        if !self.inner.membership.whiteboard_exists(join.whiteboard_id) {
            return Err(CoordinatorError::WhiteboardNotFound(join.whiteboard_id));
        }

        let mailbox = self.actor(join.whiteboard_id).await;
        let session_id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let (reply, accepted) = oneshot::channel();
        mailbox
            .send(Command::Join {
                session_id,
                author: author.clone(),
                clock: join.last_known_clock,
                reply,
            })
            .await
            .map_err(|_| CoordinatorError::Shutdown)?;
        let accepted = accepted.await.map_err(|_| CoordinatorError::Shutdown)??;

        Ok(SessionHandle::new(
            session_id,
            join.whiteboard_id,
            author,
            mailbox,
            accepted.outbound,
        ))
    }

    /// Status of a running whiteboard.
    pub async fn whiteboard_status(&self, whiteboard_id: Uuid) -> Option<WhiteboardStatus> {
        let mailbox = self.inner.actors.read().await.get(&whiteboard_id).cloned()?;
        let (reply, status) = oneshot::channel();
        mailbox.send(Command::Status { reply }).await.ok()?;
        status.await.ok()
    }

    pub async fn stats(&self) -> CoordinatorStats {
        let whiteboards = self.inner.actors.read().await.len();
        let c = &self.inner.counters;
        CoordinatorStats {
            whiteboards,
            sessions: c.sessions.load(Ordering::Relaxed),
            strokes_committed: c.strokes_committed.load(Ordering::Relaxed),
            strokes_rejected: c.strokes_rejected.load(Ordering::Relaxed),
            presence_dropped: c.presence_dropped.load(Ordering::Relaxed),
            forced_resyncs: c.forced_resyncs.load(Ordering::Relaxed),
            snapshots_taken: c.snapshots_taken.load(Ordering::Relaxed),
            persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Stop every actor, closing sessions and taking final snapshots.
    pub async fn shutdown(&self) {
        let actors: Vec<_> = self.inner.actors.write().await.drain().collect();
        for (id, mailbox) in actors {
            let (reply, done) = oneshot::channel();
            if mailbox.send(Command::Shutdown { reply }).await.is_ok() {
                let _ = done.await;
            }
            log::debug!("Actor for {id} stopped");
        }
    }

    /// Mailbox of the whiteboard's actor, starting it if needed.
    ///
    /// Only the registry insert happens under the write lock; the actor
    /// loads its state on its own task.
    async fn actor(&self, whiteboard_id: Uuid) -> mpsc::Sender<Command> {
        // Fast path: read lock
        {
            let actors = self.inner.actors.read().await;
            if let Some(mailbox) = actors.get(&whiteboard_id).filter(|m| !m.is_closed()) {
                return mailbox.clone();
            }
        }

        // Slow path: write lock to create
        let mut actors = self.inner.actors.write().await;
        // Double-check after acquiring write lock
        if let Some(mailbox) = actors.get(&whiteboard_id).filter(|m| !m.is_closed()) {
            return mailbox.clone();
        }

        let mailbox = WhiteboardActor::spawn(
            whiteboard_id,
            self.inner.store.clone(),
            self.inner.config.clone(),
            self.inner.counters.clone(),
        );
        actors.insert(whiteboard_id, mailbox.clone());
        mailbox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::membership::{OpenMembership, StaticMembership};
    use crate::protocol::Message;
    use crate::oplog::{LogEntry, Lsn};
    use crate::session::Outbound;
    use crate::storage::{MemoryStore, Snapshot};
    use crate::stroke::{Color, Point, Stroke, Tool};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Memory store whose loads can be held open or made to fail.
    #[derive(Default)]
    struct ScriptedStore {
        inner: MemoryStore,
        held: Option<(Uuid, Mutex<std::sync::mpsc::Receiver<()>>)>,
        load_started: Arc<Notify>,
        failing_loads: AtomicU32,
    }

    impl Persistence for ScriptedStore {
        fn load_snapshot(&self, whiteboard_id: Uuid) -> Result<Option<Snapshot>, PersistenceError> {
            if self
                .failing_loads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PersistenceError::Unavailable("injected load failure".into()));
            }
            if let Some((held, release)) = &self.held {
                if *held == whiteboard_id {
                    self.load_started.notify_one();
                    if let Ok(release) = release.lock() {
                        let _ = release.recv_timeout(Duration::from_secs(5));
                    }
                }
            }
            self.inner.load_snapshot(whiteboard_id)
        }

        fn save_snapshot(&self, whiteboard_id: Uuid, snapshot: &Snapshot) -> Result<(), PersistenceError> {
            self.inner.save_snapshot(whiteboard_id, snapshot)
        }

        fn append_log_entry(&self, whiteboard_id: Uuid, stroke: &Stroke, lsn: Lsn) -> Result<(), PersistenceError> {
            self.inner.append_log_entry(whiteboard_id, stroke, lsn)
        }

        fn read_log_since(&self, whiteboard_id: Uuid, after: Lsn) -> Result<Vec<LogEntry>, PersistenceError> {
            self.inner.read_log_since(whiteboard_id, after)
        }

        fn last_lsn(&self, whiteboard_id: Uuid) -> Result<Lsn, PersistenceError> {
            self.inner.last_lsn(whiteboard_id)
        }

        fn list_whiteboards(&self) -> Result<Vec<Uuid>, PersistenceError> {
            self.inner.list_whiteboards()
        }
    }

    fn coordinator_with(store: Arc<MemoryStore>, config: CoordinatorConfig) -> Coordinator {
        Coordinator::new(store, Arc::new(OpenMembership), config)
    }

    fn coordinator(store: Arc<MemoryStore>) -> Coordinator {
        coordinator_with(store, CoordinatorConfig::for_testing())
    }

    fn join_req(wb: Uuid, author: &str, clock: VectorClock) -> Join {
        Join {
            whiteboard_id: wb,
            author: author.into(),
            last_known_clock: clock,
        }
    }

    async fn join(coord: &Coordinator, wb: Uuid, author: &str) -> SessionHandle {
        coord.join(join_req(wb, author, VectorClock::new())).await.unwrap()
    }

    fn stroke(wb: Uuid, author: &str, clock: &[(&str, u64)]) -> Stroke {
        Stroke::new(
            wb,
            author,
            vec![Point::new(1.0, 1.0), Point::new(4.0, 4.0)],
            Color::BLACK,
            2.0,
            Tool::Pencil,
            VectorClock::from_pairs(clock.iter().map(|(a, c)| (*a, *c))),
        )
    }

    async fn next(handle: &mut SessionHandle) -> Option<Message> {
        let out = tokio::time::timeout(Duration::from_secs(2), handle.recv())
            .await
            .expect("timed out waiting for frame");
        out.map(|out| match out {
            Outbound::Frame(f) => Message::decode(f.as_bytes()).unwrap(),
            Outbound::Close(kind, msg) => Message::error(kind, msg),
        })
    }

    /// Next frame that is not a presence update.
    async fn next_event(handle: &mut SessionHandle) -> Message {
        loop {
            match next(handle).await {
                Some(Message::Presence(_)) => continue,
                Some(msg) => return msg,
                None => panic!("session closed"),
            }
        }
    }

    fn assert_error(msg: Message, expected: ErrorKind) {
        match msg {
            Message::Error(e) => assert_eq!(e.kind, expected, "{}", e.message),
            other => panic!("expected {expected} error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_sends_catchup_then_presence() {
        let coord = coordinator(Arc::new(MemoryStore::new()));
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;

        match next(&mut alice).await {
            Some(Message::Catchup(c)) => {
                assert_eq!(c.head_lsn, 0);
                assert!(c.snapshot.is_some());
                assert!(c.strokes.is_empty());
            }
            other => panic!("expected catchup, got {other:?}"),
        }
        match next(&mut alice).await {
            Some(Message::Presence(p)) => assert!(p.authors.contains("alice")),
            other => panic!("expected presence, got {other:?}"),
        }
        assert_eq!(coord.stats().await.sessions, 1);
        assert_eq!(coord.stats().await.whiteboards, 1);
    }

    #[tokio::test]
    async fn test_stroke_acked_and_broadcast() {
        let coord = coordinator(Arc::new(MemoryStore::new()));
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        let mut bob = join(&coord, wb, "bob").await;
        assert!(matches!(next_event(&mut alice).await, Message::Catchup(_)));
        assert!(matches!(next_event(&mut bob).await, Message::Catchup(_)));

        let s = stroke(wb, "alice", &[("alice", 1)]);
        alice.submit(s.clone()).await.unwrap();

        assert_eq!(next_event(&mut alice).await, Message::ack(1, Some(s.id)));
        assert_eq!(next_event(&mut bob).await, Message::stroke(s, Some(1)));

        let status = coord.whiteboard_status(wb).await.unwrap();
        assert_eq!(status.head_lsn, 1);
        assert_eq!(status.strokes, 1);
        assert_eq!(coord.stats().await.strokes_committed, 1);
    }

    #[tokio::test]
    async fn test_invalid_stroke_rejected_before_log() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(store.clone());
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;

        let mut empty = stroke(wb, "alice", &[("alice", 1)]);
        empty.points.clear();
        alice.submit(empty).await.unwrap();
        assert_error(next_event(&mut alice).await, ErrorKind::Validation);

        let forged = stroke(wb, "mallory", &[("mallory", 1)]);
        alice.submit(forged).await.unwrap();
        assert_error(next_event(&mut alice).await, ErrorKind::Validation);

        assert_eq!(store.entry_count(), 0);
        assert_eq!(coord.stats().await.strokes_rejected, 2);
    }

    #[tokio::test]
    async fn test_unseen_dependency_is_causal_gap() {
        let coord = coordinator(Arc::new(MemoryStore::new()));
        let wb = Uuid::new_v4();
        let mut bob = join(&coord, wb, "bob").await;
        next_event(&mut bob).await;

        bob.submit(stroke(wb, "bob", &[("alice", 4), ("bob", 1)])).await.unwrap();
        assert_error(next_event(&mut bob).await, ErrorKind::CausalGap);

        bob.submit(stroke(wb, "bob", &[("bob", 2)])).await.unwrap();
        assert_error(next_event(&mut bob).await, ErrorKind::CausalGap);
        assert_eq!(coord.whiteboard_status(wb).await.unwrap().head_lsn, 0);
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_reacked() {
        let coord = coordinator(Arc::new(MemoryStore::new()));
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;

        let s = stroke(wb, "alice", &[("alice", 1)]);
        alice.submit(s.clone()).await.unwrap();
        alice.submit(s.clone()).await.unwrap();
        assert_eq!(next_event(&mut alice).await, Message::ack(1, Some(s.id)));
        assert_eq!(next_event(&mut alice).await, Message::ack(1, Some(s.id)));
        assert_eq!(coord.whiteboard_status(wb).await.unwrap().head_lsn, 1);
    }

    #[tokio::test]
    async fn test_append_retried_with_backoff() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(store.clone());
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;

        store.fail_next_appends(2);
        let s = stroke(wb, "alice", &[("alice", 1)]);
        alice.submit(s.clone()).await.unwrap();
        assert_eq!(next_event(&mut alice).await, Message::ack(1, Some(s.id)));
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_close_session() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(store.clone());
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;

        store.fail_next_appends(4);
        let s = stroke(wb, "alice", &[("alice", 1)]);
        alice.submit(s.clone()).await.unwrap();
        assert_error(next_event(&mut alice).await, ErrorKind::Persistence);
        assert!(next(&mut alice).await.is_none());

        assert_eq!(coord.whiteboard_status(wb).await.unwrap().head_lsn, 0);
        let stats = coord.stats().await;
        assert_eq!(stats.persistence_failures, 1);
        assert_eq!(stats.sessions, 0);

        // No LSN was consumed by the failed attempt.
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;
        alice.submit(s.clone()).await.unwrap();
        assert_eq!(next_event(&mut alice).await, Message::ack(1, Some(s.id)));
    }

    #[tokio::test]
    async fn test_rejoin_with_clock_gets_only_missing_strokes() {
        let coord = coordinator(Arc::new(MemoryStore::new()));
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;

        let strokes: Vec<Stroke> = (1..=4).map(|n| stroke(wb, "alice", &[("alice", n)])).collect();
        for s in &strokes {
            alice.submit(s.clone()).await.unwrap();
            next_event(&mut alice).await;
        }

        let clock = VectorClock::from_pairs([("alice", 2)]);
        let mut bob = coord.join(join_req(wb, "bob", clock)).await.unwrap();
        match next_event(&mut bob).await {
            Message::Catchup(c) => {
                assert_eq!(c.head_lsn, 4);
                assert!(c.snapshot.is_none());
                assert_eq!(c.strokes, strokes[2..].to_vec());
            }
            other => panic!("expected catchup, got {other:?}"),
        }

        // A clock claiming unknown state gets the full snapshot.
        let ahead = VectorClock::from_pairs([("alice", 9)]);
        let mut carol = coord.join(join_req(wb, "carol", ahead)).await.unwrap();
        match next_event(&mut carol).await {
            Message::Catchup(c) => assert_eq!(c.snapshot.map(|s| s.strokes.len()), Some(4)),
            other => panic!("expected catchup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sync_request_answered_with_catchup() {
        let coord = coordinator(Arc::new(MemoryStore::new()));
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;
        let a1 = stroke(wb, "alice", &[("alice", 1)]);
        alice.submit(a1.clone()).await.unwrap();
        next_event(&mut alice).await;

        alice.sync(VectorClock::from_pairs([("zed", 0), ("alice", 1)])).await.unwrap();
        match next_event(&mut alice).await {
            Message::Catchup(c) => {
                assert!(c.snapshot.is_none());
                assert!(c.strokes.is_empty());
            }
            other => panic!("expected catchup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_join_supersedes_first() {
        let coord = coordinator(Arc::new(MemoryStore::new()));
        let wb = Uuid::new_v4();
        let mut first = join(&coord, wb, "alice").await;
        next_event(&mut first).await;
        let _second = join(&coord, wb, "alice").await;

        assert_error(next_event(&mut first).await, ErrorKind::Superseded);
        assert!(next(&mut first).await.is_none());
        let status = coord.whiteboard_status(wb).await.unwrap();
        assert_eq!(status.authors.len(), 1);
        assert_eq!(coord.stats().await.sessions, 1);
    }

    #[tokio::test]
    async fn test_membership_checks() {
        let wb = Uuid::new_v4();
        let membership = StaticMembership::new().with_author("alice").with_whiteboard(wb);
        let coord = Coordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(membership),
            CoordinatorConfig::for_testing(),
        );

        let err = coord.join(join_req(wb, "mallory", VectorClock::new())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let other = Uuid::new_v4();
        let err = coord.join(join_req(other, "alice", VectorClock::new())).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::WhiteboardNotFound(id) if id == other));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert!(coord.join(join_req(wb, "alice", VectorClock::new())).await.is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_every_n_strokes() {
        let store = Arc::new(MemoryStore::new());
        let config = CoordinatorConfig {
            snapshot_every: 3,
            ..CoordinatorConfig::for_testing()
        };
        let coord = coordinator_with(store.clone(), config);
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;

        for n in 1..=4 {
            alice.submit(stroke(wb, "alice", &[("alice", n)])).await.unwrap();
            next_event(&mut alice).await;
        }
        let status = coord.whiteboard_status(wb).await.unwrap();
        assert_eq!(status.snapshot_lsn, 3);
        assert_eq!(store.load_snapshot(wb).unwrap().map(|s| s.lsn), Some(3));
        assert_eq!(coord.stats().await.snapshots_taken, 1);
    }

    #[tokio::test]
    async fn test_failed_snapshot_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let config = CoordinatorConfig {
            snapshot_every: 2,
            ..CoordinatorConfig::for_testing()
        };
        let coord = coordinator_with(store.clone(), config);
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;

        store.fail_next_snapshots(1);
        for n in 1..=3 {
            alice.submit(stroke(wb, "alice", &[("alice", n)])).await.unwrap();
            next_event(&mut alice).await;
        }
        assert_eq!(coord.whiteboard_status(wb).await.unwrap().snapshot_lsn, 3);
    }

    #[tokio::test]
    async fn test_last_leave_snapshots() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(store.clone());
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;
        alice.submit(stroke(wb, "alice", &[("alice", 1)])).await.unwrap();
        next_event(&mut alice).await;

        alice.leave().await.unwrap();
        let status = coord.whiteboard_status(wb).await.unwrap();
        assert!(status.authors.is_empty());
        assert_eq!(status.snapshot_lsn, 1);
        assert_eq!(store.load_snapshot(wb).unwrap().map(|s| s.strokes.len()), Some(1));
    }

    #[tokio::test]
    async fn test_leave_is_broadcast() {
        let coord = coordinator(Arc::new(MemoryStore::new()));
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        let bob = join(&coord, wb, "bob").await;
        next_event(&mut alice).await;

        drop(bob);
        assert_eq!(next_event(&mut alice).await, Message::leave("bob"));
        match next(&mut alice).await {
            Some(Message::Presence(p)) => {
                assert_eq!(p.authors.into_iter().collect::<Vec<_>>(), vec!["alice".to_string()]);
            }
            other => panic!("expected presence, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_drops_session() {
        let config = CoordinatorConfig {
            heartbeat_timeout: Duration::from_millis(100),
            ..CoordinatorConfig::for_testing()
        };
        let coord = coordinator_with(Arc::new(MemoryStore::new()), config);
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;

        assert_error(next_event(&mut alice).await, ErrorKind::Timeout);
        assert!(coord.whiteboard_status(wb).await.unwrap().authors.is_empty());
        assert_eq!(coord.stats().await.sessions, 0);
    }

    #[tokio::test]
    async fn test_heartbeats_keep_session_alive() {
        let config = CoordinatorConfig {
            heartbeat_timeout: Duration::from_millis(150),
            ..CoordinatorConfig::for_testing()
        };
        let coord = coordinator_with(Arc::new(MemoryStore::new()), config);
        let wb = Uuid::new_v4();
        let alice = join(&coord, wb, "alice").await;

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            alice.heartbeat().await.unwrap();
        }
        let status = coord.whiteboard_status(wb).await.unwrap();
        assert!(status.authors.contains("alice"));
    }

    #[tokio::test]
    async fn test_slow_reader_forced_to_resync() {
        let config = CoordinatorConfig {
            outbound_buffer: 2,
            ..CoordinatorConfig::for_testing()
        };
        let coord = coordinator_with(Arc::new(MemoryStore::new()), config);
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next(&mut alice).await;
        next(&mut alice).await;
        // bob never reads: catchup + presence fill his buffer.
        let mut bob = join(&coord, wb, "bob").await;
        next(&mut alice).await;

        let s = stroke(wb, "alice", &[("alice", 1)]);
        alice.submit(s.clone()).await.unwrap();
        assert_eq!(next_event(&mut alice).await, Message::ack(1, Some(s.id)));
        let status = coord.whiteboard_status(wb).await.unwrap();
        assert_eq!(status.authors.into_iter().collect::<Vec<_>>(), vec!["alice".to_string()]);

        let stats = coord.stats().await;
        assert_eq!(stats.forced_resyncs, 1);
        assert_eq!(stats.sessions, 1);

        assert!(matches!(next(&mut bob).await, Some(Message::Catchup(_))));
        assert!(matches!(next(&mut bob).await, Some(Message::Presence(_))));
        assert!(next(&mut bob).await.is_none());
    }

    #[tokio::test]
    async fn test_presence_dropped_when_buffer_full() {
        let config = CoordinatorConfig {
            outbound_buffer: 2,
            ..CoordinatorConfig::for_testing()
        };
        let coord = coordinator_with(Arc::new(MemoryStore::new()), config);
        let wb = Uuid::new_v4();
        let _alice = join(&coord, wb, "alice").await;
        let _bob = join(&coord, wb, "bob").await;

        let stats = coord.stats().await;
        assert_eq!(stats.presence_dropped, 1);
        assert_eq!(stats.sessions, 2);
    }

    #[tokio::test]
    async fn test_recover_and_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let wb = Uuid::new_v4();
        {
            let coord = coordinator(store.clone());
            let mut alice = join(&coord, wb, "alice").await;
            next_event(&mut alice).await;
            for n in 1..=2 {
                alice.submit(stroke(wb, "alice", &[("alice", n)])).await.unwrap();
                next_event(&mut alice).await;
            }
            coord.shutdown().await;
            assert_error(next_event(&mut alice).await, ErrorKind::Shutdown);
        }

        let coord = coordinator(store);
        assert_eq!(coord.recover().await.unwrap(), 1);
        let status = coord.whiteboard_status(wb).await.unwrap();
        assert_eq!(status.head_lsn, 2);
        assert_eq!(status.strokes, 2);
        assert_eq!(status.knowledge, VectorClock::from_pairs([("alice", 2)]));
    }

    #[tokio::test]
    async fn test_loading_whiteboard_does_not_block_others() {
        let slow = Uuid::new_v4();
        let (release, held) = std::sync::mpsc::channel();
        let store = Arc::new(ScriptedStore {
            held: Some((slow, Mutex::new(held))),
            ..ScriptedStore::default()
        });
        let load_started = store.load_started.clone();
        let coord = Coordinator::new(store, Arc::new(OpenMembership), CoordinatorConfig::for_testing());

        let pending = tokio::spawn({
            let coord = coord.clone();
            async move { coord.join(join_req(slow, "alice", VectorClock::new())).await }
        });
        tokio::time::timeout(Duration::from_secs(2), load_started.notified())
            .await
            .expect("load never started");

        // The slow whiteboard is mid-load; another one still joins.
        let fast = Uuid::new_v4();
        let mut bob = tokio::time::timeout(
            Duration::from_secs(1),
            coord.join(join_req(fast, "bob", VectorClock::new())),
        )
        .await
        .expect("join waited on another whiteboard's load")
        .unwrap();
        assert!(matches!(next_event(&mut bob).await, Message::Catchup(_)));
        assert!(!pending.is_finished());

        release.send(()).unwrap();
        let mut alice = pending.await.unwrap().unwrap();
        assert!(matches!(next_event(&mut alice).await, Message::Catchup(_)));
    }

    #[tokio::test]
    async fn test_failed_load_refuses_join_then_retries() {
        let store = Arc::new(ScriptedStore {
            failing_loads: AtomicU32::new(1),
            ..ScriptedStore::default()
        });
        let coord = Coordinator::new(store, Arc::new(OpenMembership), CoordinatorConfig::for_testing());
        let wb = Uuid::new_v4();

        let err = coord.join(join_req(wb, "alice", VectorClock::new())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert!(coord.whiteboard_status(wb).await.is_none());

        let mut alice = join(&coord, wb, "alice").await;
        assert!(matches!(next_event(&mut alice).await, Message::Catchup(_)));
        assert!(coord.whiteboard_status(wb).await.is_some());
    }

    #[tokio::test]
    async fn test_reack_reports_original_lsn() {
        let coord = coordinator(Arc::new(MemoryStore::new()));
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;

        let a1 = stroke(wb, "alice", &[("alice", 1)]);
        let a2 = stroke(wb, "alice", &[("alice", 2)]);
        for s in [&a1, &a2] {
            alice.submit(s.clone()).await.unwrap();
            next_event(&mut alice).await;
        }

        // Retried after a lost ack: the reply names a1's own position.
        alice.submit(a1.clone()).await.unwrap();
        assert_eq!(next_event(&mut alice).await, Message::ack(1, Some(a1.id)));
    }

    #[tokio::test]
    async fn test_rejection_names_the_stroke() {
        let coord = coordinator(Arc::new(MemoryStore::new()));
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        next_event(&mut alice).await;

        let forged = stroke(wb, " alice", &[(" alice", 1)]);
        alice.submit(forged.clone()).await.unwrap();
        match next_event(&mut alice).await {
            Message::Error(e) => {
                assert_eq!(e.kind, ErrorKind::Validation);
                assert_eq!(e.stroke_id, Some(forged.id));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_reports_slowest_ack() {
        let coord = coordinator(Arc::new(MemoryStore::new()));
        let wb = Uuid::new_v4();
        let mut alice = join(&coord, wb, "alice").await;
        let mut bob = join(&coord, wb, "bob").await;
        next_event(&mut alice).await;
        next_event(&mut bob).await;
        assert_eq!(coord.whiteboard_status(wb).await.unwrap().min_acked_lsn, Some(0));

        for n in 1..=3 {
            alice.submit(stroke(wb, "alice", &[("alice", n)])).await.unwrap();
            next_event(&mut alice).await;
        }
        alice.ack(3).await.unwrap();
        bob.ack(2).await.unwrap();
        assert_eq!(coord.whiteboard_status(wb).await.unwrap().min_acked_lsn, Some(2));

        // Acks never move backwards and are clamped to the head.
        alice.ack(1).await.unwrap();
        bob.ack(99).await.unwrap();
        assert_eq!(coord.whiteboard_status(wb).await.unwrap().min_acked_lsn, Some(3));

        alice.leave().await.unwrap();
        bob.leave().await.unwrap();
        assert_eq!(coord.whiteboard_status(wb).await.unwrap().min_acked_lsn, None);
    }
}
