//! Edit operations submitted by clients.
//!
//! An [`Operation`] is an edit *intent*: a position and payload expressed
//! against the document version the client had when it produced the edit
//! (`base_version`). The engine rewrites intents against everything committed
//! since that version before they touch authoritative state.
//!
//! All positions and lengths are **character** offsets into the document's
//! linear content, never byte offsets.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The representative operation set of the conflict-resolution protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpKind {
    /// Insert `content` at `position`.
    Insert,
    /// Remove `length` characters starting at `position`.
    Delete,
    /// Apply a style to `length` characters starting at `position`.
    /// Carries its style token in `content`; overlapping formats are
    /// last-committed-wins by broadcast order.
    FormatRange,
}

/// A single client edit, as it flows through transform, apply, broadcast
/// and the durable log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    /// Character offset into the document content.
    pub position: usize,
    /// Inserted text (insert) or style token (format-range); empty for delete.
    pub content: String,
    /// Affected character count for delete/format-range; 0 for insert.
    pub length: usize,
    /// Document version the client had applied when producing this edit.
    pub base_version: u64,
    /// Connection that submitted the edit. Also the insert tie-break key.
    pub origin: Uuid,
    /// Per-connection monotonically increasing counter, for idempotent
    /// dedup when a client retries after a dropped connection.
    pub client_seq: u64,
}

impl Operation {
    pub fn insert(
        position: usize,
        content: impl Into<String>,
        base_version: u64,
        origin: Uuid,
        client_seq: u64,
    ) -> Self {
        Self {
            kind: OpKind::Insert,
            position,
            content: content.into(),
            length: 0,
            base_version,
            origin,
            client_seq,
        }
    }

    pub fn delete(
        position: usize,
        length: usize,
        base_version: u64,
        origin: Uuid,
        client_seq: u64,
    ) -> Self {
        Self {
            kind: OpKind::Delete,
            position,
            content: String::new(),
            length,
            base_version,
            origin,
            client_seq,
        }
    }

    pub fn format_range(
        position: usize,
        length: usize,
        style: impl Into<String>,
        base_version: u64,
        origin: Uuid,
        client_seq: u64,
    ) -> Self {
        Self {
            kind: OpKind::FormatRange,
            position,
            content: style.into(),
            length,
            base_version,
            origin,
            client_seq,
        }
    }

    /// Character count this operation inserts (0 for delete/format).
    pub fn insert_len(&self) -> usize {
        match self.kind {
            OpKind::Insert => self.content.chars().count(),
            _ => 0,
        }
    }

    /// End of the affected range, in characters (== `position` for inserts).
    pub fn end(&self) -> usize {
        self.position + self.length
    }

    /// Whether transform degraded this operation to a no-op.
    ///
    /// A delete fully swallowed by a prior delete, or an insert whose
    /// surrounding context was concurrently removed, keeps its slot in the
    /// version sequence but changes nothing when applied.
    pub fn is_noop(&self) -> bool {
        match self.kind {
            OpKind::Insert => self.content.is_empty(),
            OpKind::Delete | OpKind::FormatRange => self.length == 0,
        }
    }

    /// Structural sanity check on a freshly submitted (untransformed)
    /// operation. Rejects edits that are malformed regardless of document
    /// state; range clamping happens later, after transform.
    pub fn check_shape(&self) -> Result<(), ShapeError> {
        match self.kind {
            OpKind::Insert => {
                if self.content.is_empty() {
                    return Err(ShapeError::EmptyInsert);
                }
                if self.length != 0 {
                    return Err(ShapeError::InsertWithLength);
                }
            }
            OpKind::Delete | OpKind::FormatRange => {
                if self.length == 0 {
                    return Err(ShapeError::EmptyRange);
                }
            }
        }
        Ok(())
    }

    /// Clamp the operation into `[0, doc_len]` character bounds.
    ///
    /// Invariant after this call: `position <= doc_len` and
    /// `position + length <= doc_len`.
    pub fn clamp(&mut self, doc_len: usize) {
        if self.position > doc_len {
            self.position = doc_len;
        }
        if self.position + self.length > doc_len {
            self.length = doc_len - self.position;
        }
    }
}

/// Structural validation failures for submitted operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeError {
    /// Insert with no content.
    EmptyInsert,
    /// Insert carrying a range length.
    InsertWithLength,
    /// Delete or format-range with zero length.
    EmptyRange,
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShapeError::EmptyInsert => write!(f, "insert with empty content"),
            ShapeError::InsertWithLength => write!(f, "insert carrying a range length"),
            ShapeError::EmptyRange => write!(f, "zero-length range operation"),
        }
    }
}

impl std::error::Error for ShapeError {}
