//! In-process store used by tests and by servers run without a data dir.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

use super::{Persistence, PersistenceError, Snapshot};
use crate::oplog::{LogEntry, Lsn};
use crate::stroke::Stroke;

#[derive(Default)]
struct Board {
    snapshot: Option<Snapshot>,
    log: Vec<LogEntry>,
}

/// Volatile `Persistence` with fault injection.
#[derive(Default)]
pub struct MemoryStore {
    boards: RwLock<HashMap<Uuid, Board>>,
    failing_appends: AtomicU32,
    failing_snapshots: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` log appends fail with `Unavailable`.
    pub fn fail_next_appends(&self, n: u32) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` snapshot saves fail with `Unavailable`.
    pub fn fail_next_snapshots(&self, n: u32) {
        self.failing_snapshots.store(n, Ordering::SeqCst);
    }

    /// Total log entries across all whiteboards.
    pub fn entry_count(&self) -> usize {
        self.boards
            .read()
            .map(|b| b.values().map(|board| board.log.len()).sum())
            .unwrap_or(0)
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn poisoned<T>(_: T) -> PersistenceError {
    PersistenceError::Unavailable("memory store lock poisoned".into())
}

impl Persistence for MemoryStore {
    fn load_snapshot(&self, whiteboard_id: Uuid) -> Result<Option<Snapshot>, PersistenceError> {
        let boards = self.boards.read().map_err(poisoned)?;
        Ok(boards.get(&whiteboard_id).and_then(|b| b.snapshot.clone()))
    }

    fn save_snapshot(&self, whiteboard_id: Uuid, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        if Self::take_fault(&self.failing_snapshots) {
            return Err(PersistenceError::Unavailable("injected snapshot failure".into()));
        }
        let mut boards = self.boards.write().map_err(poisoned)?;
        boards.entry(whiteboard_id).or_default().snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn append_log_entry(&self, whiteboard_id: Uuid, stroke: &Stroke, lsn: Lsn) -> Result<(), PersistenceError> {
        if Self::take_fault(&self.failing_appends) {
            return Err(PersistenceError::Unavailable("injected append failure".into()));
        }
        let mut boards = self.boards.write().map_err(poisoned)?;
        let board = boards.entry(whiteboard_id).or_default();
        let expected = board.log.last().map_or(0, |e| e.lsn) + 1;
        if lsn != expected {
            return Err(PersistenceError::NonContiguous { expected, got: lsn });
        }
        board.log.push(LogEntry {
            lsn,
            stroke: stroke.clone(),
        });
        Ok(())
    }

    fn read_log_since(&self, whiteboard_id: Uuid, after: Lsn) -> Result<Vec<LogEntry>, PersistenceError> {
        let boards = self.boards.read().map_err(poisoned)?;
        Ok(boards
            .get(&whiteboard_id)
            .map(|b| b.log.iter().filter(|e| e.lsn > after).cloned().collect())
            .unwrap_or_default())
    }

    fn last_lsn(&self, whiteboard_id: Uuid) -> Result<Lsn, PersistenceError> {
        let boards = self.boards.read().map_err(poisoned)?;
        Ok(boards
            .get(&whiteboard_id)
            .and_then(|b| b.log.last())
            .map_or(0, |e| e.lsn))
    }

    fn list_whiteboards(&self) -> Result<Vec<Uuid>, PersistenceError> {
        let boards = self.boards.read().map_err(poisoned)?;
        Ok(boards.keys().copied().collect())
    }
}
