//! Authoritative materialized state for one document tab.
//!
//! `version` starts at 0 and increments exactly once per accepted operation;
//! `history` holds the committed operations since the last snapshot floor so
//! late-arriving edits can still be transformed. History is truncated only
//! at snapshot boundaries, never below a version a connected client may
//! still submit against.

use crate::engine::TransformError;
use crate::op::{OpKind, Operation};

/// Materialized content, version counter and transform history for one
/// `(document, tab)` pair. Exclusively owned and mutated by its session.
#[derive(Debug, Clone, Default)]
pub struct DocumentState {
    content: String,
    version: u64,
    /// Base version of `history[0]`: `history[i]` produced the transition
    /// from `floor + i` to `floor + i + 1`.
    floor: u64,
    history: Vec<Operation>,
}

impl DocumentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild state from a persisted snapshot (content + version), with an
    /// empty history floored at the snapshot version.
    pub fn from_snapshot(content: impl Into<String>, version: u64) -> Self {
        Self {
            content: content.into(),
            version,
            floor: version,
            history: Vec::new(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Document length in characters.
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    /// Oldest base version still transformable against retained history.
    pub fn history_floor(&self) -> u64 {
        self.floor
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Committed operations between `base_version` and the current version,
    /// in commit order — the transform input for a late-arriving edit.
    pub fn ops_since(&self, base_version: u64) -> Result<&[Operation], TransformError> {
        if base_version > self.version {
            return Err(TransformError::FutureBaseVersion {
                base_version,
                current: self.version,
            });
        }
        if base_version < self.floor {
            return Err(TransformError::HistoryTruncated {
                base_version,
                oldest_available: self.floor,
            });
        }
        Ok(&self.history[(base_version - self.floor) as usize..])
    }

    /// Apply an already-transformed, already-clamped operation: mutate
    /// content, bump the version, append to history. Returns the version
    /// the operation produced.
    ///
    /// Format-range operations occupy a version slot and enter history but
    /// leave the linear content untouched — styling is applied client-side
    /// from the broadcast stream.
    pub fn apply(&mut self, op: Operation) -> u64 {
        match op.kind {
            OpKind::Insert => {
                let at = byte_offset(&self.content, op.position);
                self.content.insert_str(at, &op.content);
            }
            OpKind::Delete => {
                let from = byte_offset(&self.content, op.position);
                let to = byte_offset(&self.content, op.position + op.length);
                self.content.replace_range(from..to, "");
            }
            OpKind::FormatRange => {}
        }
        self.version += 1;
        self.history.push(op);
        self.version
    }

    /// Re-apply a logged operation during recovery. The operation was
    /// transformed when it was first committed; replay is a plain apply.
    /// `logged_version` must be the next version in sequence.
    pub fn replay(&mut self, op: Operation, logged_version: u64) -> Result<u64, ReplayError> {
        if logged_version != self.version + 1 {
            return Err(ReplayError::VersionGap {
                expected: self.version + 1,
                got: logged_version,
            });
        }
        Ok(self.apply(op))
    }

    /// Replace state from a restore snapshot. The version jumps past
    /// `min_version` (the highest version ever seen) so restored state never
    /// reuses a version number clients already observed.
    pub fn restore(&mut self, content: impl Into<String>, min_version: u64) {
        self.content = content.into();
        self.version = min_version.max(self.version) + 1;
        self.floor = self.version;
        self.history.clear();
    }

    /// Drop history below `keep_from` (a snapshot floor). Callers cap
    /// `keep_from` at the oldest base version a connected client may still
    /// submit against.
    pub fn truncate_history(&mut self, keep_from: u64) {
        let keep_from = keep_from.min(self.version);
        if keep_from <= self.floor {
            return;
        }
        let drop = (keep_from - self.floor) as usize;
        self.history.drain(..drop);
        self.floor = keep_from;
    }
}

/// Byte offset of the `char_pos`-th character, clamped to the end.
fn byte_offset(s: &str, char_pos: usize) -> usize {
    s.char_indices()
        .nth(char_pos)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// Recovery replay failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayError {
    /// The logged version does not continue the current sequence.
    VersionGap { expected: u64, got: u64 },
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayError::VersionGap { expected, got } => {
                write!(f, "replay version gap: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for ReplayError {}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn origin() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn test_new_document_is_empty_at_version_zero() {
        let doc = DocumentState::new();
        assert_eq!(doc.content(), "");
        assert_eq!(doc.version(), 0);
        assert_eq!(doc.char_len(), 0);
    }

    #[test]
    fn test_apply_insert() {
        let mut doc = DocumentState::new();
        let v = doc.apply(Operation::insert(0, "hello", 0, origin(), 1));
        assert_eq!(v, 1);
        assert_eq!(doc.content(), "hello");
        let v = doc.apply(Operation::insert(5, " world", 1, origin(), 2));
        assert_eq!(v, 2);
        assert_eq!(doc.content(), "hello world");
    }

    #[test]
    fn test_apply_delete() {
        let mut doc = DocumentState::from_snapshot("hello world", 2);
        doc.apply(Operation::delete(5, 6, 2, origin(), 1));
        assert_eq!(doc.content(), "hello");
        assert_eq!(doc.version(), 3);
    }

    #[test]
    fn test_apply_format_leaves_content_untouched() {
        let mut doc = DocumentState::from_snapshot("hello", 1);
        let v = doc.apply(Operation::format_range(0, 5, "bold", 1, origin(), 1));
        assert_eq!(v, 2);
        assert_eq!(doc.content(), "hello");
        assert_eq!(doc.history_len(), 1);
    }

    #[test]
    fn test_apply_multibyte_positions() {
        let mut doc = DocumentState::new();
        doc.apply(Operation::insert(0, "héllo", 0, origin(), 1));
        doc.apply(Operation::insert(2, "X", 1, origin(), 2));
        assert_eq!(doc.content(), "héXllo");
        doc.apply(Operation::delete(1, 2, 2, origin(), 3));
        assert_eq!(doc.content(), "hllo");
    }

    #[test]
    fn test_ops_since_returns_committed_suffix() {
        let mut doc = DocumentState::new();
        doc.apply(Operation::insert(0, "a", 0, origin(), 1));
        doc.apply(Operation::insert(1, "b", 1, origin(), 2));
        doc.apply(Operation::insert(2, "c", 2, origin(), 3));

        assert_eq!(doc.ops_since(3).unwrap().len(), 0);
        assert_eq!(doc.ops_since(1).unwrap().len(), 2);
        assert_eq!(doc.ops_since(0).unwrap().len(), 3);
        assert_eq!(doc.ops_since(1).unwrap()[0].content, "b");
    }

    #[test]
    fn test_ops_since_future_version_rejected() {
        let doc = DocumentState::new();
        assert_eq!(
            doc.ops_since(5),
            Err(TransformError::FutureBaseVersion {
                base_version: 5,
                current: 0
            })
        );
    }

    #[test]
    fn test_ops_since_truncated_history_rejected() {
        let mut doc = DocumentState::new();
        for i in 0..4 {
            doc.apply(Operation::insert(0, "x", i, origin(), i + 1));
        }
        doc.truncate_history(2);
        assert!(doc.ops_since(2).is_ok());
        assert_eq!(
            doc.ops_since(1),
            Err(TransformError::HistoryTruncated {
                base_version: 1,
                oldest_available: 2
            })
        );
    }

    #[test]
    fn test_truncate_history_keeps_floor_monotonic() {
        let mut doc = DocumentState::new();
        for i in 0..4 {
            doc.apply(Operation::insert(0, "x", i, origin(), i + 1));
        }
        doc.truncate_history(3);
        assert_eq!(doc.history_floor(), 3);
        // Truncating backwards is a no-op.
        doc.truncate_history(1);
        assert_eq!(doc.history_floor(), 3);
        // Truncating past the head clamps to the current version.
        doc.truncate_history(99);
        assert_eq!(doc.history_floor(), 4);
        assert_eq!(doc.history_len(), 0);
    }

    #[test]
    fn test_from_snapshot_floors_history() {
        let doc = DocumentState::from_snapshot("content", 7);
        assert_eq!(doc.version(), 7);
        assert_eq!(doc.history_floor(), 7);
        assert!(doc.ops_since(6).is_err());
        assert!(doc.ops_since(7).unwrap().is_empty());
    }

    #[test]
    fn test_replay_requires_contiguous_versions() {
        let mut doc = DocumentState::from_snapshot("", 3);
        assert!(doc.replay(Operation::insert(0, "a", 3, origin(), 1), 4).is_ok());
        let err = doc.replay(Operation::insert(0, "b", 4, origin(), 2), 6);
        assert_eq!(err, Err(ReplayError::VersionGap { expected: 5, got: 6 }));
    }

    #[test]
    fn test_restore_bumps_past_highest_seen() {
        let mut doc = DocumentState::from_snapshot("new stuff", 0);
        doc.restore("old stuff", 41);
        assert_eq!(doc.content(), "old stuff");
        assert_eq!(doc.version(), 42);
        assert_eq!(doc.history_floor(), 42);
        assert_eq!(doc.history_len(), 0);
    }

    #[test]
    fn test_version_strictly_increases() {
        let mut doc = DocumentState::new();
        let mut last = 0;
        for i in 0..10 {
            let v = doc.apply(Operation::insert(0, "x", i, origin(), i + 1));
            assert!(v > last);
            last = v;
        }
    }
}
