//! JSON wire protocol: one object per WebSocket frame.
//!
//! Inbound frames are tagged by `kind` (the operation set plus cursor
//! updates); outbound frames by `type`. Field names are camelCase on the
//! wire. Transformed operations are broadcast with their fields flattened
//! into the frame, tagged with the version they produced:
//!
//! ```text
//! {"type":"op","version":12,"kind":"insert","position":4,"content":"hi"}
//! ```

use serde::{Deserialize, Serialize};
use tandem_core::op::{OpKind, Operation};
use uuid::Uuid;

/// Close code for a failed access check.
pub const CLOSE_ACCESS_DENIED: u16 = 4001;
/// Close code for a malformed frame or handshake.
pub const CLOSE_PROTOCOL_ERROR: u16 = 4002;

/// Cursor position and optional selection range for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<usize>,
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Insert {
        position: usize,
        content: String,
        base_version: u64,
        client_seq: u64,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        position: usize,
        length: usize,
        base_version: u64,
        client_seq: u64,
    },
    #[serde(rename_all = "camelCase")]
    FormatRange {
        position: usize,
        length: usize,
        #[serde(default)]
        content: Option<String>,
        base_version: u64,
        client_seq: u64,
    },
    #[serde(rename_all = "camelCase")]
    Cursor {
        position: usize,
        #[serde(default)]
        selection_end: Option<usize>,
    },
}

impl ClientFrame {
    /// Decode one inbound frame.
    pub fn decode(raw: &str) -> Result<Self, WireError> {
        serde_json::from_str(raw).map_err(|e| WireError::Malformed(e.to_string()))
    }

    /// Lower an edit frame into a core [`Operation`] attributed to the
    /// submitting connection. `None` for cursor frames.
    pub fn into_operation(self, origin: Uuid) -> Option<Operation> {
        match self {
            ClientFrame::Insert {
                position,
                content,
                base_version,
                client_seq,
            } => Some(Operation::insert(
                position,
                content,
                base_version,
                origin,
                client_seq,
            )),
            ClientFrame::Delete {
                position,
                length,
                base_version,
                client_seq,
            } => Some(Operation::delete(
                position,
                length,
                base_version,
                origin,
                client_seq,
            )),
            ClientFrame::FormatRange {
                position,
                length,
                content,
                base_version,
                client_seq,
            } => Some(Operation::format_range(
                position,
                length,
                content.unwrap_or_default(),
                base_version,
                origin,
                client_seq,
            )),
            ClientFrame::Cursor { .. } => None,
        }
    }
}

/// Operation fields as they appear flattened inside an `op` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OpBody {
    #[serde(rename_all = "camelCase")]
    Insert { position: usize, content: String },
    #[serde(rename_all = "camelCase")]
    Delete { position: usize, length: usize },
    #[serde(rename_all = "camelCase")]
    FormatRange {
        position: usize,
        length: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
}

impl From<&Operation> for OpBody {
    fn from(op: &Operation) -> Self {
        match op.kind {
            OpKind::Insert => OpBody::Insert {
                position: op.position,
                content: op.content.clone(),
            },
            OpKind::Delete => OpBody::Delete {
                position: op.position,
                length: op.length,
            },
            OpKind::FormatRange => OpBody::FormatRange {
                position: op.position,
                length: op.length,
                content: if op.content.is_empty() {
                    None
                } else {
                    Some(op.content.clone())
                },
            },
        }
    }
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Full document state, sent on admit and after a restore or forced
    /// resynchronization.
    #[serde(rename_all = "camelCase")]
    Snapshot { content: String, version: u64 },
    /// A committed, transformed operation, tagged with the version it
    /// produced.
    #[serde(rename_all = "camelCase")]
    Op {
        version: u64,
        #[serde(flatten)]
        body: OpBody,
    },
    /// Presence delta for one peer. `cursor: null` clears the cursor.
    #[serde(rename_all = "camelCase")]
    Presence {
        user_id: String,
        cursor: Option<CursorState>,
    },
    #[serde(rename_all = "camelCase")]
    Join { user_id: String },
    #[serde(rename_all = "camelCase")]
    Leave { user_id: String },
    /// Per-connection failure report. For access failures the connection
    /// is closed right after with code 4001.
    Error { message: String },
    /// Degraded-durability notice, delivered to owner connections only.
    Warning { message: String },
}

impl ServerFrame {
    pub fn op(version: u64, operation: &Operation) -> Self {
        ServerFrame::Op {
            version,
            body: OpBody::from(operation),
        }
    }

    /// Encode for the wire. Frame construction is infallible by shape, so
    /// an encoding failure here is a programming error worth surfacing.
    pub fn encode(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Malformed(e.to_string()))
    }
}

/// Wire-level failures.
#[derive(Debug, Clone)]
pub enum WireError {
    /// Frame is not valid JSON or violates the schema.
    Malformed(String),
    /// Handshake is missing a required query parameter.
    MissingParam(&'static str),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Malformed(e) => write!(f, "malformed frame: {e}"),
            WireError::MissingParam(p) => write!(f, "missing query parameter: {p}"),
        }
    }
}

impl std::error::Error for WireError {}
