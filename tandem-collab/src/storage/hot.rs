//! In-memory hot state store.
//!
//! The low-latency mirror of every live tab's materialized content and
//! version. Sessions write through on every accepted operation; external
//! readers get current state without touching a session. Partitioned by
//! tab key — a plain map behind one lock is enough because values are
//! small and writes are per-tab serialized by the owning session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use super::{HotStore, StoreError, TabKey};

/// Process-local [`HotStore`] implementation.
#[derive(Debug, Default)]
pub struct MemoryHotStore {
    entries: RwLock<HashMap<TabKey, (String, u64)>>,
    /// Failure injection for outage drills: when set, every call reports
    /// the store unavailable.
    unavailable: AtomicBool,
}

impl MemoryHotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (or recovery) of the hot tier.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("hot store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_up(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("hot store offline".into()));
        }
        Ok(())
    }
}

impl HotStore for MemoryHotStore {
    fn get(&self, key: &TabKey) -> Result<Option<(String, u64)>, StoreError> {
        self.check_up()?;
        let entries = self.entries.read().expect("hot store lock poisoned");
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &TabKey, content: &str, version: u64) -> Result<(), StoreError> {
        self.check_up()?;
        let mut entries = self.entries.write().expect("hot store lock poisoned");
        entries.insert(key.clone(), (content.to_string(), version));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let store = MemoryHotStore::new();
        let key = TabKey::new("doc", "tab");

        assert_eq!(store.get(&key).unwrap(), None);
        store.set(&key, "hello", 3).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(("hello".into(), 3)));
    }

    #[test]
    fn test_set_overwrites() {
        let store = MemoryHotStore::new();
        let key = TabKey::new("doc", "tab");

        store.set(&key, "v1", 1).unwrap();
        store.set(&key, "v2", 2).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(("v2".into(), 2)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_keys_are_isolated() {
        let store = MemoryHotStore::new();
        store.set(&TabKey::new("doc", "a"), "left", 1).unwrap();
        store.set(&TabKey::new("doc", "b"), "right", 9).unwrap();

        assert_eq!(
            store.get(&TabKey::new("doc", "a")).unwrap(),
            Some(("left".into(), 1))
        );
        assert_eq!(
            store.get(&TabKey::new("doc", "b")).unwrap(),
            Some(("right".into(), 9))
        );
    }

    #[test]
    fn test_unavailable_store_errors() {
        let store = MemoryHotStore::new();
        let key = TabKey::new("doc", "tab");
        store.set(&key, "x", 1).unwrap();

        store.set_unavailable(true);
        assert!(matches!(store.get(&key), Err(StoreError::Unavailable(_))));
        assert!(matches!(
            store.set(&key, "y", 2),
            Err(StoreError::Unavailable(_))
        ));

        // Recovery: previous state intact.
        store.set_unavailable(false);
        assert_eq!(store.get(&key).unwrap(), Some(("x".into(), 1)));
    }
}
