//! Persistence adapter: snapshots plus the durable operation log.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  append_log_entry   ┌──────────────────────────┐
//! │ OperationLog     │ ──────────────────► │ Persistence              │
//! │ (per whiteboard) │  read_log_since     │  ├── MemoryStore (tests) │
//! └──────────────────┘ ◄────────────────── │  └── RocksStore          │
//! ┌──────────────────┐  save/load_snapshot │      ├── CF "snapshots"  │
//! │ ConvergenceEngine│ ◄─────────────────► │      ├── CF "log"        │
//! └──────────────────┘                     │      └── CF "metadata"   │
//!                                          └──────────────────────────┘
//! ```
//!
//! Every write failure is returned to the caller. Nothing here retries or
//! swallows errors; retry policy belongs to the coordinator.

pub mod memory;
pub mod record;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::oplog::{LogEntry, Lsn};
use crate::stroke::Stroke;

pub use memory::MemoryStore;
pub use record::LogRecord;
pub use rocks::{RocksStore, StoreConfig, WhiteboardMetadata};

/// Compacted canvas state and the last LSN it includes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub whiteboard_id: Uuid,
    pub lsn: Lsn,
    /// Highest own counter per author covered by `strokes`.
    pub clock: VectorClock,
    /// Strokes in merge order.
    pub strokes: Vec<Stroke>,
    /// Seconds since the Unix epoch.
    pub taken_at: u64,
}

impl Snapshot {
    pub fn new(whiteboard_id: Uuid, lsn: Lsn, clock: VectorClock, strokes: Vec<Stroke>) -> Self {
        Self {
            whiteboard_id,
            lsn,
            clock,
            strokes,
            taken_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (snapshot, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Deserialization(e.to_string()))?;
        Ok(snapshot)
    }
}

/// Storage failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("log record {lsn} failed checksum verification")]
    Corrupt { lsn: Lsn },
    #[error("non-contiguous log append: expected lsn {expected}, got {got}")]
    NonContiguous { expected: Lsn, got: Lsn },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

/// Run a store call on the blocking pool so disk I/O never stalls the
/// async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, PersistenceError>
where
    F: FnOnce() -> Result<T, PersistenceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PersistenceError::Unavailable(format!("storage task failed: {e}")))?
}

/// Storage contract consumed by the operation log and the engine.
pub trait Persistence: Send + Sync {
    fn load_snapshot(&self, whiteboard_id: Uuid) -> Result<Option<Snapshot>, PersistenceError>;

    fn save_snapshot(&self, whiteboard_id: Uuid, snapshot: &Snapshot) -> Result<(), PersistenceError>;

    /// Durably append `stroke` at `lsn`, which must be `last_lsn + 1`.
    fn append_log_entry(&self, whiteboard_id: Uuid, stroke: &Stroke, lsn: Lsn) -> Result<(), PersistenceError>;

    /// Entries with an LSN strictly greater than `after`, in LSN order.
    fn read_log_since(&self, whiteboard_id: Uuid, after: Lsn) -> Result<Vec<LogEntry>, PersistenceError>;

    /// Highest LSN appended for `whiteboard_id` (0 if none).
    fn last_lsn(&self, whiteboard_id: Uuid) -> Result<Lsn, PersistenceError>;

    /// Whiteboards with a snapshot or at least one log entry.
    fn list_whiteboards(&self) -> Result<Vec<Uuid>, PersistenceError>;
}
