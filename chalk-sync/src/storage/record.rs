//! Checksummed on-disk form of one operation-log entry.
//!
//! ```text
//! ┌──────────┬───────────────┬──────────────────┬──────────┐
//! │ lsn      │ whiteboard_id │ stroke (bincode) │ checksum │
//! │ varint   │ 16 bytes      │ variable         │ u32      │
//! └──────────┴───────────────┴──────────────────┴──────────┘
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PersistenceError;
use crate::oplog::{LogEntry, Lsn};
use crate::stroke::Stroke;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub whiteboard_id: Uuid,
    pub stroke: Vec<u8>,
    pub checksum: u32,
}

impl LogRecord {
    pub fn new(whiteboard_id: Uuid, lsn: Lsn, stroke: &Stroke) -> Result<Self, PersistenceError> {
        let stroke = bincode::serde::encode_to_vec(stroke, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        let checksum = Self::compute_checksum(lsn, &whiteboard_id, &stroke);
        Ok(Self {
            lsn,
            whiteboard_id,
            stroke,
            checksum,
        })
    }

    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.lsn, &self.whiteboard_id, &self.stroke)
    }

    /// FNV-1a (32-bit) over every field but the checksum.
    fn compute_checksum(lsn: Lsn, whiteboard_id: &Uuid, stroke: &[u8]) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        let mut mix = |byte: u8| {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        };
        lsn.to_le_bytes().into_iter().for_each(&mut mix);
        whiteboard_id.as_bytes().iter().copied().for_each(&mut mix);
        stroke.iter().copied().for_each(&mut mix);
        hash
    }

    pub fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    /// Decode and verify; a checksum mismatch is `Corrupt`.
    pub fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (record, _): (Self, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Deserialization(e.to_string()))?;
        if !record.verify() {
            return Err(PersistenceError::Corrupt { lsn: record.lsn });
        }
        Ok(record)
    }

    pub fn into_entry(self) -> Result<LogEntry, PersistenceError> {
        let (stroke, _) = bincode::serde::decode_from_slice(&self.stroke, bincode::config::standard())
            .map_err(|e| PersistenceError::Deserialization(e.to_string()))?;
        Ok(LogEntry {
            lsn: self.lsn,
            stroke,
        })
    }
}
