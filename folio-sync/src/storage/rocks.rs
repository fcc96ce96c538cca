//! RocksDB-backed update store.
//!
//! Column families:
//! - `updates`    — Update rows (LZ4-compressed payload), keyed by
//!                  target:created_at:id so a prefix scan yields a target's
//!                  rows in order
//! - `update_ids` — Row id → `updates` key (primary-key lookups)
//! - `crud`       — Upload-queue records (checksummed, keyed by sequence)
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::crud_log::CrudRecord;
use super::{
    crud_ops, diffs_by_target, resolve_batch, summarize, CrudEntry, CrudOp, CrudTransaction,
    RowChange, StoreError, UpdateBatch, UpdateStore, UploadQueue, WatchRegistry, WatchedQuery,
    WriteKind, WriteSummary,
};
use crate::compaction::TargetLocks;
use crate::row::UpdateRow;
use crate::target::TargetKey;

/// Column family names.
const CF_UPDATES: &str = "updates";
const CF_UPDATE_IDS: &str = "update_ids";
const CF_CRUD: &str = "crud";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_UPDATES, CF_UPDATE_IDS, CF_CRUD];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Row value as stored in the `updates` column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    id: String,
    target: TargetKey,
    created_at: DateTime<Utc>,
    /// LZ4 block with prepended size
    payload: Vec<u8>,
}

impl StoredRow {
    fn encode(row: &UpdateRow) -> Result<Vec<u8>, StoreError> {
        let stored = StoredRow {
            id: row.id.clone(),
            target: row.target.clone(),
            created_at: row.created_at,
            payload: lz4_flex::compress_prepend_size(&row.update_data),
        };
        bincode::serde::encode_to_vec(&stored, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<UpdateRow, StoreError> {
        let (stored, _): (StoredRow, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        let update_data = lz4_flex::decompress_size_prepended(&stored.payload)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(UpdateRow {
            id: stored.id,
            target: stored.target,
            created_at: stored.created_at,
            update_data,
        })
    }
}

/// RocksDB-backed update log with a durable upload queue.
///
/// Writes are serialized by one mutex so that a batch, its upload-queue
/// records and its watch notifications are observed together.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, writes serialized by `write_lock`)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next upload-queue sequence number
    sequence: AtomicU64,
    /// Next upload transaction id
    next_tx: AtomicU64,
    write_lock: Mutex<()>,
    watchers: WatchRegistry,
    locks: TargetLocks,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist and
    /// recovers upload-queue counters from the `crud` family.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
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

        let (sequence, next_tx) = Self::recover_counters(&db)?;
        log::debug!(
            "opened update store at {} (next seq {sequence}, next tx {next_tx})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            next_tx: AtomicU64::new(next_tx),
            write_lock: Mutex::new(()),
            watchers: WatchRegistry::new(),
            locks: TargetLocks::new(),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_UPDATES => {
                // Payloads are already LZ4 blocks
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_UPDATE_IDS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CRUD => {
                // Sequential appends, drained from the front
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Recover the next sequence number and transaction id from the last
    /// upload-queue record.
    fn recover_counters(db: &DBWithThreadMode<SingleThreaded>) -> Result<(u64, u64), StoreError> {
        let cf = match db.cf_handle(CF_CRUD) {
            Some(cf) => cf,
            None => return Ok((0, 0)),
        };

        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((_, value))) => {
                let record = CrudRecord::decode(&value)?;
                Ok((record.seq + 1, record.tx_id + 1))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok((0, 0)),
        }
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Reads ────────────────────────────────────────────────────────

    fn get_row(&self, id: &str) -> Result<Option<UpdateRow>, StoreError> {
        let cf_ids = self.cf(CF_UPDATE_IDS)?;
        let Some(key) = self.db.get_cf(&cf_ids, id.as_bytes())? else {
            return Ok(None);
        };
        let cf_updates = self.cf(CF_UPDATES)?;
        match self.db.get_cf(&cf_updates, &key)? {
            Some(value) => Ok(Some(StoredRow::decode(&value)?)),
            None => Ok(None),
        }
    }

    fn scan_target(&self, target: &TargetKey) -> Result<Vec<UpdateRow>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = Self::target_prefix(target);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(StoredRow::decode(&value)?);
        }
        Ok(rows)
    }

    fn read_crud(&self) -> Result<Vec<CrudRecord>, StoreError> {
        let cf = self.cf(CF_CRUD)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            let record = CrudRecord::decode(&value)?;
            if !record.verify() {
                return Err(StoreError::Corrupted(record.seq));
            }
            records.push(record);
        }
        Ok(records)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// Part count, then each part length-prefixed.
    fn target_prefix(target: &TargetKey) -> Vec<u8> {
        let parts = target.parts();
        let mut key = Vec::with_capacity(4 + parts.iter().map(|p| p.len() + 4).sum::<usize>());
        key.extend_from_slice(&(parts.len() as u32).to_be_bytes());
        for part in parts {
            key.extend_from_slice(&(part.len() as u32).to_be_bytes());
            key.extend_from_slice(part.as_bytes());
        }
        key
    }

    /// Target prefix + created_at (sign-flipped micros, big-endian) + id.
    fn row_key(row: &UpdateRow) -> Vec<u8> {
        let mut key = Self::target_prefix(&row.target);
        let micros = row.created_at.timestamp_micros() as u64 ^ (1 << 63);
        key.extend_from_slice(&micros.to_be_bytes());
        key.extend_from_slice(row.id.as_bytes());
        key
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.db.write(batch)?;
        if self.config.sync_writes {
            self.db.flush_wal(true)?;
        }
        Ok(())
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stage upload-queue records for one transaction.
    fn stage_crud(&self, batch: &mut WriteBatch, ops: Vec<CrudOp>) -> Result<u64, StoreError> {
        let cf = self.cf(CF_CRUD)?;
        let tx_id = self.next_tx.fetch_add(1, Ordering::SeqCst);
        for op in ops {
            let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
            let record = CrudRecord::new(seq, tx_id, op)?;
            batch.put_cf(&cf, seq.to_be_bytes(), record.encode()?);
        }
        Ok(tx_id)
    }
}

impl UpdateStore for RocksStore {
    fn write(&self, batch: UpdateBatch, kind: WriteKind) -> Result<WriteSummary, StoreError> {
        let _guard = self.lock_writes();
        let changes = resolve_batch(&batch, |id| self.get_row(id), |t| self.scan_target(t))?;

        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_ids = self.cf(CF_UPDATE_IDS)?;
        let mut write = WriteBatch::default();
        for change in &changes {
            match change {
                RowChange::Inserted(row) => {
                    let key = Self::row_key(row);
                    write.put_cf(&cf_updates, &key, StoredRow::encode(row)?);
                    write.put_cf(&cf_ids, row.id.as_bytes(), &key);
                }
                RowChange::Removed(row) => {
                    write.delete_cf(&cf_updates, Self::row_key(row));
                    write.delete_cf(&cf_ids, row.id.as_bytes());
                }
            }
        }
        if kind == WriteKind::Local && !changes.is_empty() {
            let tx_id = self.stage_crud(&mut write, crud_ops(&changes)?)?;
            log::trace!("upload transaction {tx_id} staged");
        }

        if !write.is_empty() {
            self.commit(write)?;
        }

        let summary = summarize(&changes);
        for (target, diff) in diffs_by_target(changes) {
            self.watchers.notify(&target, diff);
        }
        Ok(summary)
    }

    fn rows(&self, target: &TargetKey) -> Result<Vec<UpdateRow>, StoreError> {
        self.scan_target(target)
    }

    fn contains(&self, id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_UPDATE_IDS)?;
        Ok(self.db.get_cf(&cf, id.as_bytes())?.is_some())
    }

    fn watch(&self, target: &TargetKey) -> Result<WatchedQuery, StoreError> {
        let _guard = self.lock_writes();
        let initial = self.scan_target(target)?;
        Ok(self.watchers.register(target, initial))
    }

    fn target_locks(&self) -> &TargetLocks {
        &self.locks
    }
}

impl UploadQueue for RocksStore {
    fn record(&self, ops: Vec<CrudOp>) -> Result<u64, StoreError> {
        let _guard = self.lock_writes();
        let mut write = WriteBatch::default();
        let tx_id = self.stage_crud(&mut write, ops)?;
        self.commit(write)?;
        Ok(tx_id)
    }

    fn next_crud_transaction(&self) -> Result<Option<CrudTransaction>, StoreError> {
        let _guard = self.lock_writes();
        let mut records = self.read_crud()?.into_iter().peekable();
        let Some(tx_id) = records.peek().map(|r| r.tx_id) else {
            return Ok(None);
        };
        let crud = records
            .take_while(|r| r.tx_id == tx_id)
            .map(CrudRecord::into_entry)
            .collect::<Result<Vec<CrudEntry>, StoreError>>()?;
        Ok(Some(CrudTransaction { tx_id, crud }))
    }

    fn complete_transaction(&self, tx_id: u64) -> Result<(), StoreError> {
        let _guard = self.lock_writes();
        let cf = self.cf(CF_CRUD)?;
        let mut write = WriteBatch::default();
        for record in self.read_crud()? {
            if record.tx_id > tx_id {
                break;
            }
            if record.tx_id == tx_id {
                write.delete_cf(&cf, record.seq.to_be_bytes());
            }
        }
        if write.is_empty() {
            return Err(StoreError::UnknownTransaction(tx_id));
        }
        self.commit(write)?;
        Ok(())
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_CRUD)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
