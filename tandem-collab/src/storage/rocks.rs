//! RocksDB-backed durable tier: operation log + named snapshots.
//!
//! Column families:
//! - `oplog`     — committed operations (bincode `LoggedOp`), keyed
//!                 `doc \0 tab \0 version_be` for ordered per-tab replay
//! - `snapshots` — full materialized state (LZ4-compressed bincode),
//!                 keyed `doc \0 tab \0 snapshot_id_be`
//! - `meta`      — per-tab metadata (latest version, counts, timestamps)
//!
//! Replay of a tab is a prefix scan over `oplog` from the version after the
//! loaded snapshot; big-endian version suffixes keep the scan in commit
//! order without sorting.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, Write-Ahead Logs)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{LoggedOp, OperationLog, SnapshotStore, StoreError, TabKey};

const CF_OPLOG: &str = "oplog";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_OPLOG, CF_SNAPSHOTS, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB).
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10).
    pub bloom_filter_bits: i32,
    /// fsync every write (default: false — RocksDB WAL batches instead).
    pub sync_writes: bool,
    /// Max open files (default: 512).
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB).
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
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

/// Per-tab metadata stored alongside the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabMetadata {
    /// Highest logged version.
    pub latest_version: u64,
    /// Operations logged since creation.
    pub op_count: u64,
    /// Snapshots taken since creation; doubles as the snapshot id source.
    pub snapshot_count: u64,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl TabMetadata {
    fn new() -> Self {
        let now = epoch_secs();
        Self {
            latest_version: 0,
            op_count: 0,
            snapshot_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// A persisted point-in-time copy of one tab's full state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: u64,
    pub version: u64,
    pub content: String,
    /// Seconds since epoch.
    pub created_at: u64,
}

impl SnapshotRecord {
    /// Encode + LZ4-compress for storage.
    fn to_compressed(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn from_compressed(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// RocksDB-backed [`OperationLog`] + [`SnapshotStore`].
pub struct RocksStore {
    /// Single-threaded mode — cross-task access synchronized by RocksDB
    /// itself, concurrency handled at the tokio layer.
    db: DBWithThreadMode<SingleThreaded>,
    sync_writes: bool,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
        db_opts.increase_parallelism(available_parallelism());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db,
            sync_writes: config.sync_writes,
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPLOG => {
                // Many small sequential writes, prefix-scanned on replay.
                opts.set_max_write_buffer_number(4);
            }
            CF_SNAPSHOTS => {
                // Large values, infrequent writes, point lookups.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_META => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("missing column family {name}")))
    }

    /// Per-tab metadata, if the tab has ever been written.
    pub fn metadata(&self, key: &TabKey) -> Result<Option<TabMetadata>, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, key.storage_prefix())? {
            Some(bytes) => Ok(Some(TabMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn metadata_or_new(&self, key: &TabKey) -> Result<TabMetadata, StoreError> {
        Ok(self.metadata(key)?.unwrap_or_else(TabMetadata::new))
    }

    /// Drop logged operations at or below `below` — called after a snapshot
    /// makes the prefix of the log redundant for replay.
    pub fn compact_log(&self, key: &TabKey, below: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let prefix = key.storage_prefix();
        let mut batch = WriteBatch::default();
        let mut removed = 0u64;

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (k, _) = item?;
            if !k.starts_with(&prefix) {
                break;
            }
            if version_from_key(&k, prefix.len()) <= below {
                batch.delete_cf(cf, k);
                removed += 1;
            } else {
                break;
            }
        }

        if removed > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(removed)
    }
}

impl OperationLog for RocksStore {
    fn append(&self, key: &TabKey, entry: &LoggedOp) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let encoded = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let mut meta = self.metadata_or_new(key)?;
        // At-least-once: a retried append overwrites the same key.
        if entry.version > meta.latest_version {
            meta.latest_version = entry.version;
            meta.op_count += 1;
        }
        meta.updated_at = epoch_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, log_key(key, entry.version), encoded);
        batch.put_cf(self.cf(CF_META)?, key.storage_prefix(), meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(entry.version)
    }

    fn read_from(&self, key: &TabKey, after: u64) -> Result<Vec<LoggedOp>, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let prefix = key.storage_prefix();
        let start = log_key(key, after.saturating_add(1));
        let mut out = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (k, v) = item?;
            if !k.starts_with(&prefix) {
                break;
            }
            let (entry, _): (LoggedOp, _) =
                bincode::serde::decode_from_slice(&v, bincode::config::standard())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            out.push(entry);
        }

        Ok(out)
    }
}

impl SnapshotStore for RocksStore {
    fn save_snapshot(
        &self,
        key: &TabKey,
        version: u64,
        content: &str,
    ) -> Result<u64, StoreError> {
        let mut meta = self.metadata_or_new(key)?;
        let snapshot_id = meta.snapshot_count + 1;

        let record = SnapshotRecord {
            snapshot_id,
            version,
            content: content.to_string(),
            created_at: epoch_secs(),
        };
        let compressed = record.to_compressed()?;

        meta.snapshot_count = snapshot_id;
        meta.latest_version = meta.latest_version.max(version);
        meta.updated_at = record.created_at;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_SNAPSHOTS)?,
            snapshot_key(key, snapshot_id),
            compressed,
        );
        batch.put_cf(self.cf(CF_META)?, key.storage_prefix(), meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        log::debug!(
            "persisted snapshot {snapshot_id} for {key} at version {version}"
        );
        Ok(snapshot_id)
    }

    fn load_snapshot(&self, key: &TabKey, snapshot_id: u64) -> Result<SnapshotRecord, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, snapshot_key(key, snapshot_id))? {
            Some(bytes) => SnapshotRecord::from_compressed(&bytes),
            None => Err(StoreError::NotFound(format!(
                "snapshot {snapshot_id} for {key}"
            ))),
        }
    }

    fn latest_snapshot(&self, key: &TabKey) -> Result<Option<SnapshotRecord>, StoreError> {
        let meta = match self.metadata(key)? {
            Some(meta) if meta.snapshot_count > 0 => meta,
            _ => return Ok(None),
        };
        Ok(Some(self.load_snapshot(key, meta.snapshot_count)?))
    }

    fn list_snapshots(&self, key: &TabKey) -> Result<Vec<(u64, u64)>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let prefix = key.storage_prefix();
        let mut out = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (k, v) = item?;
            if !k.starts_with(&prefix) {
                break;
            }
            let record = SnapshotRecord::from_compressed(&v)?;
            out.push((record.snapshot_id, record.version));
        }

        Ok(out)
    }
}

fn log_key(key: &TabKey, version: u64) -> Vec<u8> {
    let mut out = key.storage_prefix();
    out.extend_from_slice(&version.to_be_bytes());
    out
}

fn snapshot_key(key: &TabKey, snapshot_id: u64) -> Vec<u8> {
    let mut out = key.storage_prefix();
    out.extend_from_slice(&snapshot_id.to_be_bytes());
    out
}

fn version_from_key(key: &[u8], prefix_len: usize) -> u64 {
    let mut buf = [0u8; 8];
    if key.len() >= prefix_len + 8 {
        buf.copy_from_slice(&key[prefix_len..prefix_len + 8]);
    }
    u64::from_be_bytes(buf)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn available_parallelism() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::op::Operation;
    use uuid::Uuid;

    fn open_store(dir: &tempfile::TempDir) -> RocksStore {
        RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn logged(version: u64) -> LoggedOp {
        LoggedOp {
            version,
            op: Operation::insert(0, format!("op{version}"), version - 1, Uuid::new_v4(), version),
        }
    }

    #[test]
    fn test_append_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let key = TabKey::new("doc", "tab");

        for v in 1..=10 {
            store.append(&key, &logged(v)).unwrap();
        }

        let all = store.read_from(&key, 0).unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].version, 1);
        assert_eq!(all[9].version, 10);
        assert_eq!(all[4].op.content, "op5");

        let tail = store.read_from(&key, 7).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].version, 8);
    }

    #[test]
    fn test_read_from_respects_tab_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let left = TabKey::new("doc", "a");
        let right = TabKey::new("doc", "b");
        store.append(&left, &logged(1)).unwrap();
        store.append(&right, &logged(1)).unwrap();
        store.append(&right, &logged(2)).unwrap();

        assert_eq!(store.read_from(&left, 0).unwrap().len(), 1);
        assert_eq!(store.read_from(&right, 0).unwrap().len(), 2);
    }

    #[test]
    fn test_metadata_tracks_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let key = TabKey::new("doc", "tab");

        assert!(store.metadata(&key).unwrap().is_none());
        store.append(&key, &logged(1)).unwrap();
        store.append(&key, &logged(2)).unwrap();

        let meta = store.metadata(&key).unwrap().unwrap();
        assert_eq!(meta.latest_version, 2);
        assert_eq!(meta.op_count, 2);
    }

    #[test]
    fn test_retried_append_does_not_double_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let key = TabKey::new("doc", "tab");

        let entry = logged(1);
        store.append(&key, &entry).unwrap();
        store.append(&key, &entry).unwrap();

        let meta = store.metadata(&key).unwrap().unwrap();
        assert_eq!(meta.op_count, 1);
        assert_eq!(store.read_from(&key, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_roundtrip_with_compression() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let key = TabKey::new("doc", "tab");

        let content = "lorem ipsum ".repeat(500);
        let id = store.save_snapshot(&key, 42, &content).unwrap();
        assert_eq!(id, 1);

        let record = store.load_snapshot(&key, id).unwrap();
        assert_eq!(record.version, 42);
        assert_eq!(record.content, content);
    }

    #[test]
    fn test_latest_snapshot_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let key = TabKey::new("doc", "tab");

        assert!(store.latest_snapshot(&key).unwrap().is_none());
        store.save_snapshot(&key, 10, "ten").unwrap();
        store.save_snapshot(&key, 25, "twenty-five").unwrap();

        let latest = store.latest_snapshot(&key).unwrap().unwrap();
        assert_eq!(latest.version, 25);
        assert_eq!(latest.content, "twenty-five");

        assert_eq!(store.list_snapshots(&key).unwrap(), vec![(1, 10), (2, 25)]);
    }

    #[test]
    fn test_compact_log_drops_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let key = TabKey::new("doc", "tab");

        for v in 1..=10 {
            store.append(&key, &logged(v)).unwrap();
        }
        let removed = store.compact_log(&key, 6).unwrap();
        assert_eq!(removed, 6);

        let rest = store.read_from(&key, 0).unwrap();
        assert_eq!(rest.len(), 4);
        assert_eq!(rest[0].version, 7);
    }

    #[test]
    fn test_reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let key = TabKey::new("doc", "tab");

        {
            let store = open_store(&dir);
            store.append(&key, &logged(1)).unwrap();
            store.save_snapshot(&key, 1, "persisted").unwrap();
        }

        let store = open_store(&dir);
        assert_eq!(store.read_from(&key, 0).unwrap().len(), 1);
        assert_eq!(
            store.latest_snapshot(&key).unwrap().unwrap().content,
            "persisted"
        );
    }
}
