//! RocksDB-backed durable log and record store.
//!
//! The log and the store each open their own database so that either can be
//! unavailable while the other keeps serving.
//!
//! Column families:
//! - `log`  : sealed log entries keyed by id (8 bytes big-endian), uncompressed
//! - `meta` : the log's id high-water mark, so ids survive a full trim
//! - `rows` : store rows keyed by [`RowId::to_key`], LZ4-compressed payloads
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::edit_log::{DurableLog, LogEntry, LogError, SealedEntry, TailSignal};
use super::store::{RecordStore, StoreError, StoredRow};
use super::RowId;
use crate::protocol::Record;

const CF_LOG: &str = "log";
const CF_META: &str = "meta";
const CF_ROWS: &str = "rows";

const META_LAST_ID: &[u8] = b"last_id";

type Db = DBWithThreadMode<MultiThreaded>;

/// RocksDB tuning shared by the log and the store.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("grid_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Config for testing (small caches).
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

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }
}

fn open_db(config: &RocksConfig, cf_names: &[&str]) -> Result<Db, rocksdb::Error> {
    let mut db_opts = Options::default();
    db_opts.create_if_missing(true);
    db_opts.create_missing_column_families(true);
    db_opts.set_max_open_files(config.max_open_files);
    db_opts.set_keep_log_file_num(5);
    db_opts.increase_parallelism(num_cpus());

    let mut cf_opts = Options::default();
    let mut block_opts = BlockBasedOptions::default();
    let cache = Cache::new_lru_cache(config.block_cache_size);
    block_opts.set_block_cache(&cache);
    block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
    cf_opts.set_block_based_table_factory(&block_opts);
    cf_opts.set_write_buffer_size(config.write_buffer_size);
    // Log entries are short-lived and read sequentially; row payloads are
    // LZ4-compressed before they reach RocksDB.
    cf_opts.set_compression_type(DBCompressionType::None);

    let descriptors = cf_names
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
        .collect::<Vec<_>>();
    Db::open_cf_descriptors(&db_opts, &config.path, descriptors)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

fn decode_id(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

// ─── Log ──────────────────────────────────────────────────────────────

/// Durable log in a RocksDB column family.
pub struct RocksLog {
    db: Db,
    config: RocksConfig,
    /// Id of the newest entry ever appended
    last_id: AtomicU64,
    /// Serializes id assignment with the write
    append_lock: Mutex<()>,
    tail: TailSignal,
}

impl RocksLog {
    /// Open the log, continuing the id sequence from the newest stored entry.
    pub fn open(config: RocksConfig) -> Result<Self, LogError> {
        let db = open_db(&config, &[CF_LOG, CF_META]).map_err(unavailable)?;
        let last_id = Self::recover_last_id(&db);
        log::info!(
            "Opened log at {} (last id {last_id})",
            config.path.display()
        );
        Ok(Self {
            db,
            config,
            last_id: AtomicU64::new(last_id),
            append_lock: Mutex::new(()),
            tail: TailSignal::new(last_id),
        })
    }

    /// Larger of the stored high-water mark and the newest retained key.
    fn recover_last_id(db: &Db) -> u64 {
        let stored = db
            .cf_handle(CF_META)
            .and_then(|cf| db.get_cf(&cf, META_LAST_ID).ok().flatten())
            .and_then(|bytes| decode_id(&bytes))
            .unwrap_or(0);
        let newest = db
            .cf_handle(CF_LOG)
            .and_then(|cf| match db.iterator_cf(&cf, IteratorMode::End).next() {
                Some(Ok((key, _))) => decode_id(&key),
                _ => None,
            })
            .unwrap_or(0);
        stored.max(newest)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn log_cf(&self) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, LogError> {
        self.db
            .cf_handle(CF_LOG)
            .ok_or_else(|| LogError::TransportUnavailable("column family 'log' missing".into()))
    }

    /// Number of retained entries.
    pub fn len(&self) -> Result<usize, LogError> {
        Ok(self.scan(1, u64::MAX)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, LogError> {
        Ok(self.len()? == 0)
    }

    /// Entries in `[from, to]`. Corrupted entries are skipped.
    fn scan(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, LogError> {
        let cf = self.log_cf()?;
        let start = from.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(unavailable)?;
            let Some(id) = decode_id(&key) else {
                continue;
            };
            if id > to {
                break;
            }
            match SealedEntry::decode(&value) {
                Ok(sealed) if sealed.verify() && sealed.id == id => {
                    entries.push(sealed.into_entry());
                }
                Ok(_) => log::warn!("Skipping log entry {id}: checksum mismatch"),
                Err(e) => log::warn!("Skipping log entry {id}: {e}"),
            }
        }
        Ok(entries)
    }
}

fn unavailable(e: rocksdb::Error) -> LogError {
    LogError::TransportUnavailable(e.to_string())
}

#[async_trait]
impl DurableLog for RocksLog {
    async fn append(&self, record: &Record) -> Result<u64, LogError> {
        let payload = record.encode().map_err(|e| LogError::Codec(e.to_string()))?;
        let cf = self.log_cf()?;
        let meta = self
            .db
            .cf_handle(CF_META)
            .ok_or_else(|| LogError::TransportUnavailable("column family 'meta' missing".into()))?;

        let id = {
            let _guard = self
                .append_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let id = self.last_id.load(Ordering::SeqCst) + 1;
            let sealed = SealedEntry::seal(&LogEntry::new(id, payload));
            let mut batch = WriteBatch::default();
            batch.put_cf(&cf, id.to_be_bytes(), sealed.encode()?);
            batch.put_cf(&meta, META_LAST_ID, id.to_be_bytes());
            self.db
                .write_opt(batch, &self.config.write_options())
                .map_err(unavailable)?;
            self.last_id.store(id, Ordering::SeqCst);
            id
        };
        self.tail.publish(id);
        Ok(id)
    }

    async fn read_blocking(
        &self,
        cursor: u64,
        timeout: Option<Duration>,
    ) -> Result<Vec<LogEntry>, LogError> {
        self.tail
            .wait_for_entries(cursor, timeout, |c| match c.checked_add(1) {
                Some(from) => self.scan(from, u64::MAX),
                None => Ok(Vec::new()),
            })
            .await
    }

    async fn range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, LogError> {
        self.scan(from, to)
    }

    async fn trim(&self, keep_at_least: usize, persisted_through: u64) -> Result<u64, LogError> {
        let cf = self.log_cf()?;

        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(unavailable)?;
            if let Some(id) = decode_id(&key) {
                ids.push(id);
            }
        }

        let removable = ids.len().saturating_sub(keep_at_least);
        let mut batch = WriteBatch::default();
        let mut removed = 0u64;
        for id in ids.into_iter().take(removable) {
            if id > persisted_through {
                break;
            }
            batch.delete_cf(&cf, id.to_be_bytes());
            removed += 1;
        }

        if removed > 0 {
            self.db.write(batch).map_err(unavailable)?;
        }
        Ok(removed)
    }

    async fn tip(&self) -> Result<u64, LogError> {
        Ok(self.last_id.load(Ordering::SeqCst))
    }

    async fn ping(&self) -> bool {
        self.db.cf_handle(CF_LOG).is_some()
            && self
                .db
                .property_value("rocksdb.estimate-num-keys")
                .is_ok()
    }
}

// ─── Store ────────────────────────────────────────────────────────────

/// Record store in a RocksDB column family.
pub struct RocksStore {
    db: Db,
    config: RocksConfig,
    /// Makes the existence check and the put one step
    insert_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let db = open_db(&config, &[CF_ROWS]).map_err(store_unavailable)?;
        log::info!("Opened store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            insert_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(CF_ROWS)
            .ok_or_else(|| StoreError::Database("column family 'rows' missing".into()))
    }
}

fn store_unavailable(e: rocksdb::Error) -> StoreError {
    StoreError::StoreUnavailable(e.to_string())
}

#[async_trait]
impl RecordStore for RocksStore {
    async fn insert_if_absent(&self, id: RowId, payload: &str) -> Result<u64, StoreError> {
        let cf = self.cf()?;
        let key = id.to_key();
        let compressed = lz4_flex::compress_prepend_size(payload.as_bytes());

        let _guard = self
            .insert_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.db.get_pinned_cf(&cf, &key).map_err(store_unavailable)?.is_some() {
            return Ok(0);
        }
        self.db
            .put_cf_opt(&cf, &key, &compressed, &self.config.write_options())
            .map_err(store_unavailable)?;
        Ok(1)
    }

    async fn scan_all(&self) -> Result<Vec<StoredRow>, StoreError> {
        let cf = self.cf()?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(store_unavailable)?;
            let Some(id) = RowId::from_key(&key) else {
                log::warn!("Skipping store row with unrecognized key ({} bytes)", key.len());
                continue;
            };
            match decode_row(&value) {
                Ok(payload) => rows.push(StoredRow { id, payload }),
                Err(e) => log::warn!("Skipping unreadable store row {id}: {e}"),
            }
        }
        Ok(rows)
    }

    async fn ping(&self) -> bool {
        self.cf().is_ok()
            && self
                .db
                .property_value("rocksdb.estimate-num-keys")
                .is_ok()
    }
}

fn decode_row(value: &[u8]) -> Result<String, StoreError> {
    let bytes = lz4_flex::decompress_size_prepended(value)
        .map_err(|e| StoreError::Codec(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}
