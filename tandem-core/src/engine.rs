//! Operational-transformation engine.
//!
//! The single entry point is [`transform`]: rewrite an incoming operation
//! against the sequence of operations committed since the client's
//! `base_version`, in commit order, so that applying the result to current
//! content produces the edit the client intended.
//!
//! ```text
//! client op (base_version = 5)
//!       │
//!       ▼
//! transform(op, history[5..])     fold, one committed op at a time
//!       │
//!       ▼
//! op' — same intent, coordinates valid at the current version
//! ```
//!
//! Determinism is the load-bearing property: `transform` is a pure function
//! of its inputs — no hidden state, no randomness, no clocks — so every
//! replica replaying the same committed sequence reaches byte-identical
//! content. The test suite pins this down with permutation checks.
//!
//! Range-overlap rules that the protocol leaves open are resolved here and
//! recorded in DESIGN.md:
//! - an insert landing strictly inside a concurrently deleted range degrades
//!   to a no-op at the range start (its surrounding context is gone), the
//!   same degradation a fully-swallowed delete undergoes;
//! - a delete/format range with a concurrent insert strictly inside widens
//!   to keep covering every character it originally targeted;
//! - operations from the same origin are never folded against each other —
//!   a connection's later edits already reflect its own earlier ones.

use crate::op::{OpKind, Operation};

/// Internal signal that an operation cannot be reconciled against retained
/// history. Never surfaced to clients as-is; the session recovers by forcing
/// the submitter to resynchronize from a fresh snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformError {
    /// `base_version` predates the oldest retained history entry.
    HistoryTruncated {
        base_version: u64,
        oldest_available: u64,
    },
    /// `base_version` is ahead of the authoritative version.
    FutureBaseVersion { base_version: u64, current: u64 },
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::HistoryTruncated {
                base_version,
                oldest_available,
            } => write!(
                f,
                "base version {base_version} predates retained history (oldest {oldest_available})"
            ),
            TransformError::FutureBaseVersion {
                base_version,
                current,
            } => write!(
                f,
                "base version {base_version} is ahead of authoritative version {current}"
            ),
        }
    }
}

impl std::error::Error for TransformError {}

/// Rewrite `op` against `concurrent`, the operations committed between
/// `op.base_version` and the current version, in commit order.
///
/// Pure: identical inputs produce identical outputs on every replica.
/// The caller clamps the result against current document bounds afterwards.
pub fn transform(op: &Operation, concurrent: &[Operation]) -> Operation {
    let mut out = op.clone();
    for prior in concurrent {
        // A connection's own committed edits are already reflected in the
        // coordinates of its later edits.
        if prior.origin == out.origin {
            continue;
        }
        transform_against(&mut out, prior);
    }
    out
}

/// Fold one committed operation into `op`'s coordinates.
fn transform_against(op: &mut Operation, prior: &Operation) {
    match prior.kind {
        OpKind::Insert => transform_against_insert(op, prior),
        OpKind::Delete => transform_against_delete(op, prior),
        // Formats annotate; they shift no offsets.
        OpKind::FormatRange => {}
    }
}

fn transform_against_insert(op: &mut Operation, prior: &Operation) {
    let ins_pos = prior.position;
    let ins_len = prior.insert_len();

    match op.kind {
        OpKind::Insert => {
            // Position tie broken by origin id: the lexicographically
            // smaller origin is treated as occurring first, so the same
            // left-to-right order falls out on every replica regardless
            // of arrival order.
            if ins_pos < op.position || (ins_pos == op.position && prior.origin < op.origin) {
                op.position += ins_len;
            }
        }
        OpKind::Delete | OpKind::FormatRange => {
            if ins_pos <= op.position {
                op.position += ins_len;
            } else if ins_pos < op.end() {
                // Insert strictly inside the range: widen so the range
                // still covers every character it originally targeted.
                op.length += ins_len;
            }
        }
    }
}

fn transform_against_delete(op: &mut Operation, prior: &Operation) {
    let del_start = prior.position;
    let del_len = prior.length;
    let del_end = prior.end();

    match op.kind {
        OpKind::Insert => {
            if del_end <= op.position {
                op.position -= del_len;
            } else if del_start < op.position {
                // Strictly inside the removed range: the context this
                // insert targeted no longer exists. Degrade to a no-op
                // pinned at the range start rather than resurrecting text
                // into a neighborhood the other replica never had.
                op.position = del_start;
                op.content.clear();
            }
            // Insert at or before the range start is untouched.
        }
        OpKind::Delete | OpKind::FormatRange => {
            let start = op.position;
            let end = op.end();
            if del_end <= start {
                op.position -= del_len;
            } else if del_start >= end {
                // Disjoint, after this range: nothing to do.
            } else {
                // Overlap: subtract whatever the prior delete already
                // consumed. Fully swallowed ranges degrade to length 0.
                let overlap = del_end.min(end) - del_start.max(start);
                op.length -= overlap;
                op.position = start.min(del_start);
            }
        }
    }
}
