//! Per-whiteboard operation log.
//!
//! The log is the single serialization point for a whiteboard: `append`
//! hands out the next LSN only after the entry is durable, so LSNs are
//! strictly increasing with no gaps and a failed write consumes nothing.
//! Entries past the last snapshot are cached in memory; older ranges are
//! read back from the store.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{Persistence, PersistenceError};
use crate::stroke::Stroke;

/// Log sequence number. The first committed stroke is LSN 1; 0 means "nothing".
pub type Lsn = u64;

/// A committed stroke and its position in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub lsn: Lsn,
    pub stroke: Stroke,
}

pub struct OperationLog {
    whiteboard_id: Uuid,
    store: Arc<dyn Persistence>,
    head: Lsn,
    /// Entries with LSN > `base`, contiguous.
    cache: Vec<LogEntry>,
    base: Lsn,
}

impl OperationLog {
    /// Open the log, caching every entry after `base` (usually the
    /// snapshot LSN).
    pub fn open(
        whiteboard_id: Uuid,
        store: Arc<dyn Persistence>,
        base: Lsn,
    ) -> Result<Self, PersistenceError> {
        let cache = store.read_log_since(whiteboard_id, base)?;
        let mut expected = base + 1;
        for entry in &cache {
            if entry.lsn != expected {
                return Err(PersistenceError::NonContiguous {
                    expected,
                    got: entry.lsn,
                });
            }
            expected += 1;
        }
        let head = cache
            .last()
            .map_or(base, |e| e.lsn)
            .max(store.last_lsn(whiteboard_id)?);

        log::debug!(
            "Opened log for {whiteboard_id}: base {base}, head {head}, {} cached",
            cache.len()
        );
        Ok(Self {
            whiteboard_id,
            store,
            head,
            cache,
            base,
        })
    }

    /// Durably append `stroke` and return its LSN.
    pub fn append(&mut self, stroke: &Stroke) -> Result<Lsn, PersistenceError> {
        let lsn = self.next_lsn();
        self.store.append_log_entry(self.whiteboard_id, stroke, lsn)?;
        self.record(lsn, stroke.clone())?;
        Ok(lsn)
    }

    /// LSN the next append will be written at.
    pub fn next_lsn(&self) -> Lsn {
        self.head + 1
    }

    /// Advance past an entry already written to the store at `next_lsn()`.
    ///
    /// Used by callers that perform the store write themselves, off the
    /// async runtime.
    pub fn record(&mut self, lsn: Lsn, stroke: Stroke) -> Result<(), PersistenceError> {
        let expected = self.next_lsn();
        if lsn != expected {
            return Err(PersistenceError::NonContiguous { expected, got: lsn });
        }
        self.head = lsn;
        self.cache.push(LogEntry { lsn, stroke });
        Ok(())
    }

    /// Strokes with `from <= lsn <= to`, in LSN order.
    pub fn read_range(&self, from: Lsn, to: Lsn) -> Result<Vec<Stroke>, PersistenceError> {
        let from = from.max(1);
        let to = to.min(self.head);
        if from > to {
            return Ok(Vec::new());
        }
        if from > self.base {
            let start = (from - self.base - 1) as usize;
            let end = (to - self.base) as usize;
            return Ok(self
                .cache
                .get(start..end.min(self.cache.len()))
                .unwrap_or_default()
                .iter()
                .map(|e| e.stroke.clone())
                .collect());
        }
        Ok(self
            .store
            .read_log_since(self.whiteboard_id, from - 1)?
            .into_iter()
            .take_while(|e| e.lsn <= to)
            .map(|e| e.stroke)
            .collect())
    }

    /// Every committed stroke, in LSN order.
    pub fn read_all(&self) -> Result<Vec<Stroke>, PersistenceError> {
        self.read_range(1, self.head)
    }

    /// Entries with an LSN strictly greater than `after`.
    pub fn entries_after(&self, after: Lsn) -> Result<Vec<LogEntry>, PersistenceError> {
        if after >= self.base {
            let skip = (after - self.base) as usize;
            return Ok(self.cache.iter().skip(skip).cloned().collect());
        }
        self.store.read_log_since(self.whiteboard_id, after)
    }

    /// Drop cached entries up to and including `up_to`; they stay in the store.
    pub fn truncate_cache(&mut self, up_to: Lsn) {
        let up_to = up_to.min(self.head);
        if up_to <= self.base {
            return;
        }
        let drop = ((up_to - self.base) as usize).min(self.cache.len());
        self.cache.drain(..drop);
        self.base = up_to;
    }

    pub fn head(&self) -> Lsn {
        self.head
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn whiteboard_id(&self) -> Uuid {
        self.whiteboard_id
    }
}
