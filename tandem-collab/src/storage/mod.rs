//! Hybrid persistence for document tabs.
//!
//! Two asymmetric stores, partitioned by tab key — no cross-key
//! interaction, so no global lock:
//!
//! ```text
//! ┌──────────────────┐ write-through  ┌──────────────────┐
//! │ DocumentSession  │ ─────────────► │ HotStore          │  content+version,
//! │ (in-memory)      │                │ (in-memory KV)    │  low-latency
//! └────────┬─────────┘                └──────────────────┘
//!          │ fire-and-forget
//!          ▼
//! ┌──────────────────┐   backoff      ┌──────────────────┐
//! │ RetryQueue       │ ─────────────► │ OperationLog      │  append-only,
//! │ (bounded)        │                │ (RocksDB)         │  replayable
//! └──────────────────┘                └──────────────────┘
//! ```
//!
//! A slow or unavailable durable tier never stalls live editing; the retry
//! queue absorbs the outage and reports degradation instead of losing
//! writes silently.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod hot;
pub mod memory;
pub mod retry;
pub mod rocks;

use serde::{Deserialize, Serialize};
use tandem_core::op::Operation;

pub use hot::MemoryHotStore;
pub use memory::{MemoryOpLog, MemorySnapshotStore};
pub use retry::{DurabilityEvent, RetryConfig, RetryQueue};
pub use rocks::{RocksStore, SnapshotRecord, StoreConfig, TabMetadata};

/// Storage key for one independently-versioned document tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabKey {
    pub document_id: String,
    pub tab_id: String,
}

impl TabKey {
    pub fn new(document_id: impl Into<String>, tab_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            tab_id: tab_id.into(),
        }
    }

    /// Byte prefix for ordered per-tab scans: both ids NUL-terminated so
    /// no tab's prefix can alias another's.
    pub fn storage_prefix(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(self.document_id.len() + self.tab_id.len() + 2);
        out.extend_from_slice(self.document_id.as_bytes());
        out.push(0);
        out.extend_from_slice(self.tab_id.as_bytes());
        out.push(0);
        out
    }
}

impl std::fmt::Display for TabKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.document_id, self.tab_id)
    }
}

/// One committed operation as it lands in the durable log: the transformed
/// operation plus the version it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedOp {
    pub version: u64,
    pub op: Operation,
}

/// Append-only durable record of accepted operations (at-least-once
/// append, replay from a version). The durability collaborator interface.
pub trait OperationLog: Send + Sync {
    /// Append one committed operation. Returns the logged version.
    fn append(&self, key: &TabKey, entry: &LoggedOp) -> Result<u64, StoreError>;

    /// All logged operations with version strictly greater than `after`,
    /// in version order.
    fn read_from(&self, key: &TabKey, after: u64) -> Result<Vec<LoggedOp>, StoreError>;
}

/// Low-latency materialized content + version per tab. The hot-store
/// collaborator interface.
pub trait HotStore: Send + Sync {
    fn get(&self, key: &TabKey) -> Result<Option<(String, u64)>, StoreError>;
    fn set(&self, key: &TabKey, content: &str, version: u64) -> Result<(), StoreError>;
}

/// Named point-in-time snapshots for version history and restore, distinct
/// from the rolling operation log.
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot; returns the assigned snapshot id.
    fn save_snapshot(
        &self,
        key: &TabKey,
        version: u64,
        content: &str,
    ) -> Result<u64, StoreError>;

    fn load_snapshot(&self, key: &TabKey, snapshot_id: u64) -> Result<SnapshotRecord, StoreError>;

    /// Most recent snapshot, if any.
    fn latest_snapshot(&self, key: &TabKey) -> Result<Option<SnapshotRecord>, StoreError>;

    /// `(snapshot_id, version)` pairs, oldest first.
    fn list_snapshots(&self, key: &TabKey) -> Result<Vec<(u64, u64)>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backing database failure.
    DatabaseError(String),
    /// The store is (possibly temporarily) unreachable.
    Unavailable(String),
    /// No such snapshot / tab.
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "database error: {e}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::NotFound(what) => write!(f, "not found: {what}"),
            StoreError::SerializationError(e) => write!(f, "serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
