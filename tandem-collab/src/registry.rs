//! Session registry: at most one live session per `(document, tab)`.
//!
//! An explicitly owned object created at startup and passed to connection
//! handlers — not a process global. Resolution is double-checked under the
//! write lock so two racing connections can never observe two independent
//! authoritative states for the same tab. Sessions unregister themselves
//! after their drain grace period; `shutdown` drains every session for a
//! clean process exit.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use tandem_core::document::DocumentState;

use crate::session::{DocumentSession, SessionConfig, SessionHandle, SessionMap};
use crate::storage::{HotStore, OperationLog, SnapshotStore, StoreError, TabKey};

/// Process-wide map from tab key to its live session.
pub struct SessionRegistry {
    sessions: SessionMap,
    config: SessionConfig,
    hot: Arc<dyn HotStore>,
    log: Arc<dyn OperationLog>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        hot: Arc<dyn HotStore>,
        log: Arc<dyn OperationLog>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
            hot,
            log,
            snapshots,
        }
    }

    /// Return the live session for a tab, creating (and recovering) it if
    /// absent. Guarantees at most one live session object per key.
    pub async fn resolve(&self, key: &TabKey) -> Result<SessionHandle, StoreError> {
        // Fast path: read lock.
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(key) {
                if !handle.is_closed() {
                    return Ok(handle.clone());
                }
            }
        }

        // Slow path: write lock, double-check, then create.
        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(key) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
            // A session that stopped without unregistering (teardown race):
            // replace it.
            sessions.remove(key);
        }

        let doc = self.recover(key)?;
        log::info!(
            "creating session for {key} at version {} ({} logged ops replayed)",
            doc.version(),
            doc.history_len()
        );
        let handle = DocumentSession::spawn(
            key.clone(),
            doc,
            self.config.clone(),
            self.hot.clone(),
            self.log.clone(),
            self.snapshots.clone(),
            self.sessions.clone(),
        );
        sessions.insert(key.clone(), handle.clone());
        Ok(handle)
    }

    /// Rebuild tab state: hot store first, else latest snapshot plus the
    /// operation-log tail above it. A hot-store outage is fatal to session
    /// creation ([`StoreError::Unavailable`]); already-running sessions are
    /// unaffected.
    fn recover(&self, key: &TabKey) -> Result<DocumentState, StoreError> {
        if let Some((content, version)) = self.hot.get(key)? {
            log::debug!("recovered {key} from hot store at version {version}");
            return Ok(DocumentState::from_snapshot(content, version));
        }

        let mut doc = match self.snapshots.latest_snapshot(key) {
            Ok(Some(record)) => {
                log::debug!(
                    "recovered {key} from snapshot {} at version {}",
                    record.snapshot_id,
                    record.version
                );
                DocumentState::from_snapshot(record.content, record.version)
            }
            Ok(None) => DocumentState::new(),
            Err(e) => {
                // Degraded durable tier must not block a fresh tab.
                log::warn!("snapshot load failed for {key}: {e}, starting empty");
                DocumentState::new()
            }
        };

        match self.log.read_from(key, doc.version()) {
            Ok(tail) => {
                for entry in tail {
                    if let Err(e) = doc.replay(entry.op, entry.version) {
                        log::error!("log replay aborted for {key}: {e}");
                        break;
                    }
                }
            }
            Err(e) => log::warn!("log replay unavailable for {key}: {e}"),
        }

        Ok(doc)
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.values().filter(|h| !h.is_closed()).count()
    }

    /// Keys of all live sessions.
    pub async fn active_tabs(&self) -> Vec<TabKey> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drain every session (final snapshots included) for process exit.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };
        log::info!("registry shutdown: draining {} sessions", handles.len());
        for handle in handles {
            let _ = handle.shutdown().await;
        }
        self.sessions.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LoggedOp, MemoryHotStore, MemoryOpLog, MemorySnapshotStore};
    use tandem_core::access::Role;
    use tandem_core::op::Operation;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Stores {
        hot: Arc<MemoryHotStore>,
        log: Arc<MemoryOpLog>,
        snapshots: Arc<MemorySnapshotStore>,
    }

    fn stores() -> Stores {
        Stores {
            hot: Arc::new(MemoryHotStore::new()),
            log: Arc::new(MemoryOpLog::new()),
            snapshots: Arc::new(MemorySnapshotStore::new()),
        }
    }

    fn registry(s: &Stores) -> SessionRegistry {
        let mut config = SessionConfig::for_testing();
        config.grace_period = std::time::Duration::from_secs(30);
        SessionRegistry::new(
            config,
            s.hot.clone(),
            s.log.clone(),
            s.snapshots.clone(),
        )
    }

    #[tokio::test]
    async fn test_resolve_returns_same_session() {
        let s = stores();
        let registry = registry(&s);
        let key = TabKey::new("doc", "tab");

        let h1 = registry.resolve(&key).await.unwrap();
        let h2 = registry.resolve(&key).await.unwrap();
        assert_eq!(h1.session_id(), h2.session_id());
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_resolve_isolates_tabs() {
        let s = stores();
        let registry = registry(&s);

        let h1 = registry.resolve(&TabKey::new("doc", "a")).await.unwrap();
        let h2 = registry.resolve(&TabKey::new("doc", "b")).await.unwrap();
        assert_ne!(h1.session_id(), h2.session_id());
        assert_eq!(registry.session_count().await, 2);

        let tabs = registry.active_tabs().await;
        assert!(tabs.contains(&TabKey::new("doc", "a")));
        assert!(tabs.contains(&TabKey::new("doc", "b")));
    }

    #[tokio::test]
    async fn test_resolve_recovers_from_hot_store() {
        let s = stores();
        let key = TabKey::new("doc", "tab");
        s.hot.set(&key, "warm state", 7).unwrap();

        let registry = registry(&s);
        let handle = registry.resolve(&key).await.unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.content, "warm state");
        assert_eq!(stats.version, 7);
    }

    #[tokio::test]
    async fn test_resolve_recovers_from_snapshot_and_log_tail() {
        let s = stores();
        let key = TabKey::new("doc", "tab");
        s.snapshots.save_snapshot(&key, 2, "ab").unwrap();
        for (version, ch) in [(3u64, "c"), (4, "d")] {
            s.log
                .append(
                    &key,
                    &LoggedOp {
                        version,
                        op: Operation::insert(
                            (version - 1) as usize,
                            ch,
                            version - 1,
                            Uuid::new_v4(),
                            version,
                        ),
                    },
                )
                .unwrap();
        }

        let registry = registry(&s);
        let handle = registry.resolve(&key).await.unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.content, "abcd");
        assert_eq!(stats.version, 4);
    }

    #[tokio::test]
    async fn test_hot_store_outage_blocks_new_sessions_only() {
        let s = stores();
        let registry = registry(&s);

        let running = registry.resolve(&TabKey::new("doc", "up")).await.unwrap();
        s.hot.set_unavailable(true);

        // New session creation fails while the hot tier is down.
        let err = registry.resolve(&TabKey::new("doc", "down")).await;
        assert!(matches!(err, Err(StoreError::Unavailable(_))));

        // The existing session keeps serving from memory.
        assert!(running.stats().await.is_ok());

        s.hot.set_unavailable(false);
        assert!(registry.resolve(&TabKey::new("doc", "down")).await.is_ok());
    }

    #[tokio::test]
    async fn test_dead_handle_is_replaced() {
        let s = stores();
        let registry = registry(&s);
        let key = TabKey::new("doc", "tab");

        let h1 = registry.resolve(&key).await.unwrap();
        h1.shutdown().await.unwrap();
        assert!(h1.is_closed());

        let h2 = registry.resolve(&key).await.unwrap();
        assert_ne!(h1.session_id(), h2.session_id());
        assert!(!h2.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_drains_all_sessions() {
        let s = stores();
        let registry = registry(&s);

        let key = TabKey::new("doc", "tab");
        let handle = registry.resolve(&key).await.unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let conn = handle.admit("alice", Some(Role::Owner), tx).await.unwrap();
        handle
            .submit(conn, Operation::insert(0, "persist me", 0, conn, 1))
            .await
            .unwrap();

        registry.shutdown().await;
        assert_eq!(registry.session_count().await, 0);
        assert!(handle.is_closed());

        let latest = s.snapshots.latest_snapshot(&key).unwrap().unwrap();
        assert_eq!(latest.content, "persist me");
    }
}
