//! RocksDB-backed persistence.
//!
//! Column families:
//! - `snapshots` — latest canvas snapshot per whiteboard (bincode, LZ4)
//! - `log`       — checksummed log records keyed by `whiteboard_id ‖ lsn`
//! - `metadata`  — per-whiteboard counters (bincode)
//!
//! Log keys are the 16 whiteboard id bytes followed by the LSN in big-endian,
//! so a forward iterator from `(id, lsn)` walks one whiteboard's log in LSN
//! order.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;

use super::record::LogRecord;
use super::{Persistence, PersistenceError, Snapshot};
use crate::oplog::{LogEntry, Lsn};
use crate::stroke::Stroke;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_LOG: &str = "log";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_LOG, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every log append (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("chalk_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-whiteboard bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteboardMetadata {
    pub whiteboard_id: Uuid,
    pub last_lsn: Lsn,
    pub snapshot_lsn: Lsn,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl WhiteboardMetadata {
    fn new(whiteboard_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            whiteboard_id,
            last_lsn: 0,
            snapshot_lsn: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed `Persistence`.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes metadata read-modify-write.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened RocksDB store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Values are already LZ4 compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_LOG => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Metadata for a whiteboard, if it has ever been written.
    pub fn metadata(&self, whiteboard_id: Uuid) -> Result<Option<WhiteboardMetadata>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, whiteboard_id.as_bytes())? {
            Some(bytes) => Ok(Some(WhiteboardMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Force memtables to disk.
    pub fn flush(&self) -> Result<(), PersistenceError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, PersistenceError> {
        self.write_lock
            .lock()
            .map_err(|_| PersistenceError::Unavailable("store write lock poisoned".into()))
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Database(format!("column family '{name}' not found")))
    }

    fn log_key(whiteboard_id: Uuid, lsn: Lsn) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..16].copy_from_slice(whiteboard_id.as_bytes());
        key[16..].copy_from_slice(&lsn.to_be_bytes());
        key
    }
}

impl Persistence for RocksStore {
    fn load_snapshot(&self, whiteboard_id: Uuid) -> Result<Option<Snapshot>, PersistenceError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(cf, whiteboard_id.as_bytes())? else {
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| PersistenceError::Compression(e.to_string()))?;
        Snapshot::decode(&bytes).map(Some)
    }

    fn save_snapshot(&self, whiteboard_id: Uuid, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = snapshot.encode()?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let _guard = self.lock()?;
        let mut meta = self
            .metadata(whiteboard_id)?
            .unwrap_or_else(|| WhiteboardMetadata::new(whiteboard_id));
        meta.snapshot_lsn = snapshot.lsn;
        meta.snapshot_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snap, whiteboard_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, whiteboard_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!(
            "Saved snapshot for {whiteboard_id} at lsn {} ({} -> {} bytes)",
            snapshot.lsn,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }

    fn append_log_entry(&self, whiteboard_id: Uuid, stroke: &Stroke, lsn: Lsn) -> Result<(), PersistenceError> {
        let cf_log = self.cf(CF_LOG)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let record = LogRecord::new(whiteboard_id, lsn, stroke)?.encode()?;

        let _guard = self.lock()?;
        let mut meta = self
            .metadata(whiteboard_id)?
            .unwrap_or_else(|| WhiteboardMetadata::new(whiteboard_id));
        let expected = meta.last_lsn + 1;
        if lsn != expected {
            return Err(PersistenceError::NonContiguous { expected, got: lsn });
        }
        meta.last_lsn = lsn;
        meta.updated_at = now_secs();

        // Record and metadata land atomically.
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_log, Self::log_key(whiteboard_id, lsn), &record);
        batch.put_cf(cf_meta, whiteboard_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn read_log_since(&self, whiteboard_id: Uuid, after: Lsn) -> Result<Vec<LogEntry>, PersistenceError> {
        let cf = self.cf(CF_LOG)?;
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };
        let start_key = Self::log_key(whiteboard_id, start);

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != whiteboard_id.as_bytes() {
                break;
            }
            let entry = LogRecord::decode(&value)?.into_entry()?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn last_lsn(&self, whiteboard_id: Uuid) -> Result<Lsn, PersistenceError> {
        Ok(self.metadata(whiteboard_id)?.map_or(0, |m| m.last_lsn))
    }

    fn list_whiteboards(&self) -> Result<Vec<Uuid>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| PersistenceError::Deserialization("invalid whiteboard key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
