//! In-memory operation log and snapshot store.
//!
//! The durability tier for storage-less deployments (no `storage_path`
//! configured) and the failure-injection harness for outage tests: flip
//! `set_unavailable(true)` and every append fails until recovery, which is
//! exactly the degradation the retry queue is built to absorb.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use super::rocks::SnapshotRecord;
use super::{LoggedOp, OperationLog, SnapshotStore, StoreError, TabKey};

/// Process-local [`OperationLog`].
#[derive(Debug, Default)]
pub struct MemoryOpLog {
    entries: RwLock<HashMap<TabKey, Vec<LoggedOp>>>,
    unavailable: AtomicBool,
}

impl MemoryOpLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (or recovery) of the durable tier.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Number of entries logged for a tab.
    pub fn len(&self, key: &TabKey) -> usize {
        self.entries
            .read()
            .expect("op log lock poisoned")
            .get(key)
            .map_or(0, Vec::len)
    }

    fn check_up(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("operation log offline".into()));
        }
        Ok(())
    }
}

impl OperationLog for MemoryOpLog {
    fn append(&self, key: &TabKey, entry: &LoggedOp) -> Result<u64, StoreError> {
        self.check_up()?;
        let mut entries = self.entries.write().expect("op log lock poisoned");
        let log = entries.entry(key.clone()).or_default();
        // At-least-once: a retried append of an already-logged version is
        // absorbed rather than duplicated.
        if log.last().map_or(true, |last| entry.version > last.version) {
            log.push(entry.clone());
        }
        Ok(entry.version)
    }

    fn read_from(&self, key: &TabKey, after: u64) -> Result<Vec<LoggedOp>, StoreError> {
        self.check_up()?;
        let entries = self.entries.read().expect("op log lock poisoned");
        Ok(entries
            .get(key)
            .map(|log| {
                log.iter()
                    .filter(|e| e.version > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Process-local [`SnapshotStore`].
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<TabKey, Vec<SnapshotRecord>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save_snapshot(
        &self,
        key: &TabKey,
        version: u64,
        content: &str,
    ) -> Result<u64, StoreError> {
        let mut snapshots = self.snapshots.write().expect("snapshot lock poisoned");
        let list = snapshots.entry(key.clone()).or_default();
        let snapshot_id = list.last().map_or(1, |s| s.snapshot_id + 1);
        list.push(SnapshotRecord {
            snapshot_id,
            version,
            content: content.to_string(),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        });
        Ok(snapshot_id)
    }

    fn load_snapshot(&self, key: &TabKey, snapshot_id: u64) -> Result<SnapshotRecord, StoreError> {
        let snapshots = self.snapshots.read().expect("snapshot lock poisoned");
        snapshots
            .get(key)
            .and_then(|list| list.iter().find(|s| s.snapshot_id == snapshot_id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("snapshot {snapshot_id} for {key}")))
    }

    fn latest_snapshot(&self, key: &TabKey) -> Result<Option<SnapshotRecord>, StoreError> {
        let snapshots = self.snapshots.read().expect("snapshot lock poisoned");
        Ok(snapshots.get(key).and_then(|list| list.last().cloned()))
    }

    fn list_snapshots(&self, key: &TabKey) -> Result<Vec<(u64, u64)>, StoreError> {
        let snapshots = self.snapshots.read().expect("snapshot lock poisoned");
        Ok(snapshots
            .get(key)
            .map(|list| list.iter().map(|s| (s.snapshot_id, s.version)).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::op::Operation;
    use uuid::Uuid;

    fn logged(version: u64) -> LoggedOp {
        LoggedOp {
            version,
            op: Operation::insert(0, "x", version - 1, Uuid::new_v4(), version),
        }
    }

    #[test]
    fn test_append_and_read_from() {
        let log = MemoryOpLog::new();
        let key = TabKey::new("doc", "tab");

        for v in 1..=5 {
            log.append(&key, &logged(v)).unwrap();
        }

        assert_eq!(log.read_from(&key, 0).unwrap().len(), 5);
        let tail = log.read_from(&key, 3).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].version, 4);
        assert_eq!(tail[1].version, 5);
    }

    #[test]
    fn test_retried_append_is_idempotent() {
        let log = MemoryOpLog::new();
        let key = TabKey::new("doc", "tab");

        let entry = logged(1);
        log.append(&key, &entry).unwrap();
        log.append(&key, &entry).unwrap();
        assert_eq!(log.len(&key), 1);
    }

    #[test]
    fn test_outage_and_recovery() {
        let log = MemoryOpLog::new();
        let key = TabKey::new("doc", "tab");

        log.append(&key, &logged(1)).unwrap();
        log.set_unavailable(true);
        assert!(matches!(
            log.append(&key, &logged(2)),
            Err(StoreError::Unavailable(_))
        ));
        assert!(log.read_from(&key, 0).is_err());

        log.set_unavailable(false);
        log.append(&key, &logged(2)).unwrap();
        assert_eq!(log.read_from(&key, 0).unwrap().len(), 2);
    }

    #[test]
    fn test_snapshot_ids_are_monotonic() {
        let store = MemorySnapshotStore::new();
        let key = TabKey::new("doc", "tab");

        let id1 = store.save_snapshot(&key, 10, "ten").unwrap();
        let id2 = store.save_snapshot(&key, 20, "twenty").unwrap();
        assert!(id2 > id1);

        assert_eq!(store.load_snapshot(&key, id1).unwrap().content, "ten");
        assert_eq!(store.latest_snapshot(&key).unwrap().unwrap().version, 20);
        assert_eq!(store.list_snapshots(&key).unwrap(), vec![(id1, 10), (id2, 20)]);
    }

    #[test]
    fn test_missing_snapshot_not_found() {
        let store = MemorySnapshotStore::new();
        let key = TabKey::new("doc", "tab");
        assert!(matches!(
            store.load_snapshot(&key, 7),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.latest_snapshot(&key).unwrap().is_none());
    }
}
