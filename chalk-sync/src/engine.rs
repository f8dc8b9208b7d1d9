//! Convergence engine: merges strokes into one deterministic canvas.
//!
//! One engine exists per whiteboard replica (the coordinator's authoritative
//! copy and each client's local copy). Its lifecycle:
//!
//! ```text
//!   Empty ──begin_loading──► Loading ──finish_loading──► Ready
//!                            │  replay(snapshot + log tail)
//!                            │  submit() queues live strokes
//! ```
//!
//! Applying is all-or-nothing per stroke: every check runs before the
//! canvas is touched. Re-applying a known stroke id is a no-op, and the
//! canvas order depends only on stroke data, so replicas that applied the
//! same strokes (each author's strokes in emission order) are identical.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use uuid::Uuid;

use crate::canvas::{CanvasDelta, CanvasState};
use crate::clock::VectorClock;
use crate::oplog::Lsn;
use crate::storage::Snapshot;
use crate::stroke::{self, Stroke, StrokeId, ValidationError};

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Empty,
    Loading,
    Ready,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Empty => write!(f, "empty"),
            EngineState::Loading => write!(f, "loading"),
            EngineState::Ready => write!(f, "ready"),
        }
    }
}

/// Result of offering a stroke to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Stroke merged; the delta covers its bounding box.
    Applied(CanvasDelta),
    /// Stroke id already on the canvas; nothing changed.
    Duplicate,
    /// Engine is loading; the stroke waits until `finish_loading`.
    Queued,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("engine is {0}, operation requires ready")]
    NotReady(EngineState),
    #[error("invalid stroke: {0}")]
    Validation(#[from] ValidationError),
    /// A predecessor of this stroke has not been applied yet.
    #[error("causal gap for {author}: expected counter {expected}, got {got}")]
    CausalGap {
        author: String,
        expected: u64,
        got: u64,
    },
    #[error("stroke belongs to whiteboard {got}, engine holds {expected}")]
    WrongWhiteboard { expected: Uuid, got: Uuid },
}

pub struct ConvergenceEngine {
    whiteboard_id: Uuid,
    state: EngineState,
    canvas: CanvasState,
    /// Highest own counter applied per author.
    seen: VectorClock,
    lsn: Lsn,
    /// Log position of every stroke merged with one.
    committed: HashMap<StrokeId, Lsn>,
    /// LSN of the snapshot the canvas was seeded from.
    restored_lsn: Lsn,
    pending: VecDeque<Stroke>,
    since_snapshot: u64,
}

impl ConvergenceEngine {
    pub fn new(whiteboard_id: Uuid) -> Self {
        Self {
            whiteboard_id,
            state: EngineState::Empty,
            canvas: CanvasState::new(),
            seen: VectorClock::new(),
            lsn: 0,
            committed: HashMap::new(),
            restored_lsn: 0,
            pending: VecDeque::new(),
            since_snapshot: 0,
        }
    }

    /// A ready engine over an empty canvas.
    pub fn ready(whiteboard_id: Uuid) -> Self {
        Self {
            state: EngineState::Ready,
            ..Self::new(whiteboard_id)
        }
    }

    /// Build a ready engine from a snapshot and the log entries after it.
    pub fn restore(
        whiteboard_id: Uuid,
        snapshot: Option<Snapshot>,
        tail: impl IntoIterator<Item = (Lsn, Stroke)>,
    ) -> Result<Self, EngineError> {
        let mut engine = Self::new(whiteboard_id);
        engine.begin_loading(snapshot)?;
        for (lsn, stroke) in tail {
            engine.replay(lsn, stroke)?;
        }
        engine.finish_loading()?;
        Ok(engine)
    }

    /// Enter `Loading`, seeding the canvas from `snapshot` if given.
    pub fn begin_loading(&mut self, snapshot: Option<Snapshot>) -> Result<(), EngineError> {
        if self.state != EngineState::Empty {
            return Err(EngineError::NotReady(self.state));
        }
        if let Some(snapshot) = snapshot {
            if snapshot.whiteboard_id != self.whiteboard_id {
                return Err(EngineError::WrongWhiteboard {
                    expected: self.whiteboard_id,
                    got: snapshot.whiteboard_id,
                });
            }
            for stroke in snapshot.strokes {
                let own = stroke.own_counter();
                if own > self.seen.get(&stroke.author) {
                    self.seen.set(stroke.author.clone(), own);
                }
                self.canvas.insert(stroke);
            }
            self.lsn = snapshot.lsn;
            self.restored_lsn = snapshot.lsn;
        }
        self.state = EngineState::Loading;
        Ok(())
    }

    /// Apply a committed stroke from the snapshot's log tail.
    pub fn replay(&mut self, lsn: Lsn, stroke: Stroke) -> Result<(), EngineError> {
        if self.state != EngineState::Loading {
            return Err(EngineError::NotReady(self.state));
        }
        self.merge(stroke, Some(lsn))?;
        self.lsn = self.lsn.max(lsn);
        Ok(())
    }

    /// Enter `Ready` and apply strokes queued while loading.
    ///
    /// Queued strokes that fail their checks are dropped; they never reached
    /// the canvas.
    pub fn finish_loading(&mut self) -> Result<Vec<CanvasDelta>, EngineError> {
        if self.state != EngineState::Loading {
            return Err(EngineError::NotReady(self.state));
        }
        self.state = EngineState::Ready;
        self.since_snapshot = 0;

        let mut deltas = Vec::new();
        while let Some(stroke) = self.pending.pop_front() {
            let id = stroke.id;
            match self.merge(stroke, None) {
                Ok(ApplyOutcome::Applied(delta)) => deltas.push(delta),
                Ok(_) => {}
                Err(e) => log::warn!("Dropping queued stroke {id} on {}: {e}", self.whiteboard_id),
            }
        }
        log::debug!(
            "Whiteboard {} ready: {} strokes at lsn {}",
            self.whiteboard_id,
            self.canvas.len(),
            self.lsn
        );
        Ok(deltas)
    }

    /// Offer a live stroke: applied when ready, queued while loading.
    pub fn submit(&mut self, stroke: Stroke) -> Result<ApplyOutcome, EngineError> {
        match self.state {
            EngineState::Ready => self.apply(stroke),
            EngineState::Loading => {
                self.pending.push_back(stroke);
                Ok(ApplyOutcome::Queued)
            }
            EngineState::Empty => Err(EngineError::NotReady(self.state)),
        }
    }

    /// Merge one stroke into the canvas.
    pub fn apply(&mut self, stroke: Stroke) -> Result<ApplyOutcome, EngineError> {
        if self.state != EngineState::Ready {
            return Err(EngineError::NotReady(self.state));
        }
        self.merge(stroke, None)
    }

    /// Merge a stroke the operation log has assigned `lsn`.
    pub fn apply_committed(&mut self, lsn: Lsn, stroke: Stroke) -> Result<ApplyOutcome, EngineError> {
        if self.state != EngineState::Ready {
            return Err(EngineError::NotReady(self.state));
        }
        let outcome = self.merge(stroke, Some(lsn))?;
        self.lsn = self.lsn.max(lsn);
        Ok(outcome)
    }

    /// Check that every counter `stroke` depends on is already known here.
    ///
    /// The engine itself tolerates cross-author reordering; an authority
    /// that receives strokes straight from their authors uses this to detect
    /// a client that has seen state this replica never had.
    pub fn check_dependencies(&self, stroke: &Stroke) -> Result<(), EngineError> {
        for (author, counter) in stroke.vector_clock.iter() {
            if author == stroke.author {
                continue;
            }
            let known = self.seen.get(author);
            if counter > known {
                return Err(EngineError::CausalGap {
                    author: author.to_string(),
                    expected: known,
                    got: counter,
                });
            }
        }
        Ok(())
    }

    /// Current canvas plus the LSN it reflects.
    pub fn snapshot(&self) -> Result<Snapshot, EngineError> {
        if self.state != EngineState::Ready {
            return Err(EngineError::NotReady(self.state));
        }
        Ok(Snapshot::new(
            self.whiteboard_id,
            self.lsn,
            self.seen.clone(),
            self.canvas.strokes().cloned().collect(),
        ))
    }

    /// Strokes not causally known to `remote`, in merge order.
    ///
    /// A stroke is known to `remote` iff `remote` holds its author's counter
    /// at or above the stroke's own counter.
    pub fn diverged(&self, remote: &VectorClock) -> Vec<Stroke> {
        self.canvas
            .strokes()
            .filter(|s| s.own_counter() > remote.get(&s.author))
            .cloned()
            .collect()
    }

    /// Log position a stroke on the canvas was committed at.
    ///
    /// Strokes seeded from a snapshot report the snapshot's LSN, the newest
    /// position they can hold. Uncommitted or unknown strokes give `None`.
    pub fn committed_lsn(&self, id: &StrokeId) -> Option<Lsn> {
        if let Some(lsn) = self.committed.get(id) {
            return Some(*lsn);
        }
        (self.restored_lsn > 0 && self.canvas.contains(id)).then_some(self.restored_lsn)
    }

    /// Highest own counter applied per author.
    pub fn knowledge(&self) -> &VectorClock {
        &self.seen
    }

    pub fn canvas(&self) -> &CanvasState {
        &self.canvas
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn whiteboard_id(&self) -> Uuid {
        self.whiteboard_id
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Strokes applied since the last `mark_snapshot`.
    pub fn strokes_since_snapshot(&self) -> u64 {
        self.since_snapshot
    }

    pub fn mark_snapshot(&mut self) {
        self.since_snapshot = 0;
    }

    /// Drop all state and return to `Empty`.
    pub fn reset(&mut self) {
        *self = Self::new(self.whiteboard_id);
    }

    /// Run every check `apply` would, without touching the canvas.
    ///
    /// Returns `Ok(false)` for a stroke id already on the canvas.
    pub fn admit(&self, stroke: &Stroke) -> Result<bool, EngineError> {
        if stroke.whiteboard_id != self.whiteboard_id {
            return Err(EngineError::WrongWhiteboard {
                expected: self.whiteboard_id,
                got: stroke.whiteboard_id,
            });
        }
        if self.canvas.contains(&stroke.id) {
            return Ok(false);
        }
        stroke::validate(stroke, &self.seen)?;

        let own = stroke.own_counter();
        let expected = self.seen.get(&stroke.author) + 1;
        if own != expected {
            return Err(EngineError::CausalGap {
                author: stroke.author.clone(),
                expected,
                got: own,
            });
        }
        Ok(true)
    }

    fn merge(&mut self, stroke: Stroke, lsn: Option<Lsn>) -> Result<ApplyOutcome, EngineError> {
        if !self.admit(&stroke)? {
            return Ok(ApplyOutcome::Duplicate);
        }
        let own = stroke.own_counter();

        // validate() guarantees at least one point.
        let region = match stroke.bounds() {
            Some(b) => b,
            None => return Err(ValidationError::EmptyPoints.into()),
        };
        self.seen.set(stroke.author.clone(), own);
        if let Some(lsn) = lsn {
            self.committed.insert(stroke.id, lsn);
        }
        self.canvas.insert(stroke);
        self.since_snapshot += 1;

        Ok(ApplyOutcome::Applied(
            self.canvas.delta_for(self.whiteboard_id, region, lsn),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stroke::{Color, Point, Tool};

    fn board() -> Uuid {
        Uuid::from_u128(0xb0a4d)
    }

    fn stroke(author: &str, clock: &[(&str, u64)], x: f32) -> Stroke {
        Stroke::new(
            board(),
            author,
            vec![Point::new(x, 0.0), Point::new(x + 5.0, 5.0)],
            Color::BLACK,
            2.0,
            Tool::Pencil,
            VectorClock::from_pairs(clock.iter().map(|(a, c)| (*a, *c))),
        )
    }

    fn ready() -> ConvergenceEngine {
        ConvergenceEngine::ready(board())
    }

    #[test]
    fn test_lifecycle() {
        let mut engine = ConvergenceEngine::new(board());
        assert_eq!(engine.state(), EngineState::Empty);
        assert!(matches!(
            engine.apply(stroke("a", &[("a", 1)], 0.0)),
            Err(EngineError::NotReady(EngineState::Empty))
        ));

        engine.begin_loading(None).unwrap();
        assert_eq!(engine.state(), EngineState::Loading);
        assert!(engine.snapshot().is_err());

        engine.finish_loading().unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        assert!(engine.begin_loading(None).is_err());
    }

    #[test]
    fn test_live_strokes_queue_while_loading() {
        let a1 = stroke("a", &[("a", 1)], 0.0);
        let a2 = stroke("a", &[("a", 2)], 10.0);

        let mut engine = ConvergenceEngine::new(board());
        engine.begin_loading(None).unwrap();

        // a2 arrives live before a1 has been replayed.
        assert_eq!(engine.submit(a2.clone()).unwrap(), ApplyOutcome::Queued);
        assert!(engine.canvas().is_empty());
        engine.replay(1, a1).unwrap();

        let deltas = engine.finish_loading().unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(engine.canvas().len(), 2);
        assert_eq!(engine.pending_len(), 0);
        assert!(engine.canvas().contains(&a2.id));
    }

    #[test]
    fn test_apply_returns_region_delta() {
        let mut engine = ready();
        let near = stroke("a", &[("a", 1)], 0.0);
        let far = stroke("b", &[("b", 1)], 900.0);
        engine.apply(far).unwrap();

        match engine.apply(near.clone()).unwrap() {
            ApplyOutcome::Applied(delta) => {
                assert_eq!(delta.region, near.bounds().unwrap());
                assert_eq!(delta.ops.len(), 1);
                assert_eq!(delta.ops[0].id, near.id);
            }
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[test]
    fn test_reapply_is_noop() {
        let mut engine = ready();
        let s = stroke("a", &[("a", 1)], 0.0);
        engine.apply(s.clone()).unwrap();
        let before = engine.canvas().canonical_bytes();

        assert_eq!(engine.apply(s).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(engine.canvas().canonical_bytes(), before);
        assert_eq!(engine.strokes_since_snapshot(), 1);
    }

    #[test]
    fn test_replay_with_new_id_rejected() {
        let mut engine = ready();
        engine.apply(stroke("a", &[("a", 1)], 0.0)).unwrap();
        let err = engine.apply(stroke("a", &[("a", 1)], 3.0)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::Replay { .. })));
        assert_eq!(engine.canvas().len(), 1);
    }

    #[test]
    fn test_own_gap_is_causal_gap() {
        let mut engine = ready();
        let err = engine.apply(stroke("a", &[("a", 2)], 0.0)).unwrap_err();
        assert_eq!(
            err,
            EngineError::CausalGap {
                author: "a".into(),
                expected: 1,
                got: 2
            }
        );
        assert!(engine.canvas().is_empty());
    }

    #[test]
    fn test_failed_apply_leaves_state_untouched() {
        let mut engine = ready();
        engine.apply(stroke("a", &[("a", 1)], 0.0)).unwrap();
        let before = engine.canvas().canonical_bytes();
        let clock_before = engine.knowledge().clone();

        let mut bad = stroke("a", &[("a", 2)], 0.0);
        bad.points.clear();
        assert!(engine.apply(bad).is_err());
        assert_eq!(engine.canvas().canonical_bytes(), before);
        assert_eq!(engine.knowledge(), &clock_before);
    }

    #[test]
    fn test_admit_does_not_mutate() {
        let mut engine = ready();
        let a1 = stroke("a", &[("a", 1)], 0.0);
        assert!(engine.admit(&a1).unwrap());
        assert!(engine.canvas().is_empty());

        engine.apply(a1.clone()).unwrap();
        assert!(!engine.admit(&a1).unwrap());
        assert!(engine.admit(&stroke("a", &[("a", 3)], 0.0)).is_err());
    }

    #[test]
    fn test_wrong_whiteboard_rejected() {
        let mut engine = ready();
        let mut s = stroke("a", &[("a", 1)], 0.0);
        s.whiteboard_id = Uuid::new_v4();
        assert!(matches!(engine.apply(s), Err(EngineError::WrongWhiteboard { .. })));
    }

    #[test]
    fn test_cross_author_order_converges() {
        let a1 = stroke("A", &[("A", 1)], 0.0);
        let a2 = stroke("A", &[("A", 2)], 2.0);
        let b1 = stroke("B", &[("A", 1), ("B", 1)], 1.0);

        let mut one = ready();
        for s in [a1.clone(), b1.clone(), a2.clone()] {
            one.apply(s).unwrap();
        }
        let mut two = ready();
        for s in [a1.clone(), a2.clone(), b1.clone()] {
            two.apply(s).unwrap();
        }
        // b1 before its dependency a1 is still a valid per-author order.
        let mut three = ready();
        for s in [b1, a1, a2] {
            three.apply(s).unwrap();
        }

        assert_eq!(one.canvas().canonical_bytes(), two.canvas().canonical_bytes());
        assert_eq!(one.canvas().canonical_bytes(), three.canvas().canonical_bytes());
        let authors: Vec<&str> = one.canvas().strokes().map(|s| s.author.as_str()).collect();
        assert_eq!(authors, vec!["A", "A", "B"]);
    }

    #[test]
    fn test_check_dependencies() {
        let mut engine = ready();
        let b1 = stroke("B", &[("A", 1), ("B", 1)], 0.0);
        assert!(matches!(
            engine.check_dependencies(&b1),
            Err(EngineError::CausalGap { ref author, expected: 0, got: 1 }) if author == "A"
        ));
        engine.apply(stroke("A", &[("A", 1)], 0.0)).unwrap();
        assert!(engine.check_dependencies(&b1).is_ok());
    }

    #[test]
    fn test_diverged_returns_exactly_unknown_strokes() {
        let mut engine = ready();
        let a1 = stroke("A", &[("A", 1)], 0.0);
        let a2 = stroke("A", &[("A", 2)], 1.0);
        let b1 = stroke("B", &[("A", 1), ("B", 1)], 2.0);
        let b2 = stroke("B", &[("A", 1), ("B", 2)], 3.0);
        for s in [a1.clone(), a2.clone(), b1.clone(), b2.clone()] {
            engine.apply(s).unwrap();
        }

        let remote = VectorClock::from_pairs([("A", 1), ("B", 1)]);
        let missing: Vec<_> = engine.diverged(&remote).into_iter().map(|s| s.id).collect();
        assert_eq!(missing.len(), 2);
        assert!(missing.contains(&a2.id));
        assert!(missing.contains(&b2.id));

        assert!(engine.diverged(engine.knowledge()).is_empty());
        assert_eq!(engine.diverged(&VectorClock::new()).len(), 4);
    }

    #[test]
    fn test_diverged_strokes_apply_cleanly_on_lagging_replica() {
        let mut leader = ready();
        let mut follower = ready();
        let a1 = stroke("A", &[("A", 1)], 0.0);
        leader.apply(a1.clone()).unwrap();
        follower.apply(a1).unwrap();

        for s in [
            stroke("A", &[("A", 2)], 1.0),
            stroke("B", &[("A", 2), ("B", 1)], 2.0),
            stroke("A", &[("A", 3), ("B", 1)], 3.0),
        ] {
            leader.apply(s).unwrap();
        }

        for s in leader.diverged(follower.knowledge()) {
            follower.apply(s).unwrap();
        }
        assert_eq!(leader.canvas().digest(), follower.canvas().digest());
    }

    #[test]
    fn test_snapshot_restore_equals_full_replay() {
        let mut engine = ready();
        let strokes: Vec<Stroke> = (1..=8)
            .map(|i| stroke("A", &[("A", i)], i as f32))
            .collect();
        for (i, s) in strokes.iter().enumerate().take(5) {
            engine.apply_committed(i as u64 + 1, s.clone()).unwrap();
        }
        let snap = engine.snapshot().unwrap();
        assert_eq!(snap.lsn, 5);

        let tail: Vec<(Lsn, Stroke)> = strokes[5..]
            .iter()
            .enumerate()
            .map(|(i, s)| (i as u64 + 6, s.clone()))
            .collect();
        let restored = ConvergenceEngine::restore(board(), Some(snap), tail.clone()).unwrap();

        let full = ConvergenceEngine::restore(
            board(),
            None,
            strokes.iter().cloned().enumerate().map(|(i, s)| (i as u64 + 1, s)),
        )
        .unwrap();

        assert_eq!(restored.lsn(), 8);
        assert_eq!(restored.canvas().canonical_bytes(), full.canvas().canonical_bytes());
        assert_eq!(restored.knowledge(), full.knowledge());
    }

    #[test]
    fn test_committed_lsn_lookup() {
        let strokes: Vec<Stroke> = (1..=4).map(|i| stroke("A", &[("A", i)], i as f32)).collect();
        let mut engine = ready();
        engine.apply_committed(1, strokes[0].clone()).unwrap();
        engine.apply_committed(2, strokes[1].clone()).unwrap();
        assert_eq!(engine.committed_lsn(&strokes[0].id), Some(1));
        assert_eq!(engine.committed_lsn(&strokes[1].id), Some(2));

        // Optimistic local strokes have no log position.
        engine.apply(strokes[2].clone()).unwrap();
        assert_eq!(engine.committed_lsn(&strokes[2].id), None);
        assert_eq!(engine.committed_lsn(&Uuid::new_v4()), None);

        let snap = ConvergenceEngine::restore(
            board(),
            None,
            strokes[..2].iter().cloned().enumerate().map(|(i, s)| (i as u64 + 1, s)),
        )
        .unwrap()
        .snapshot()
        .unwrap();
        let restored = ConvergenceEngine::restore(board(), Some(snap), [(3, strokes[2].clone())]).unwrap();
        assert_eq!(restored.committed_lsn(&strokes[0].id), Some(2));
        assert_eq!(restored.committed_lsn(&strokes[2].id), Some(3));
    }

    #[test]
    fn test_reset_returns_to_empty() {
        let mut engine = ready();
        engine.apply(stroke("a", &[("a", 1)], 0.0)).unwrap();
        engine.reset();
        assert_eq!(engine.state(), EngineState::Empty);
        assert!(engine.canvas().is_empty());
        assert!(engine.knowledge().is_empty());
    }
}
