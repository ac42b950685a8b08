//! Presence tracking: who is in the tab, and where their cursor is.
//!
//! Kept inside each session, keyed by connection. Presence is ephemeral —
//! it never touches the durable log and never blocks on persistence. A
//! cursor update that doesn't change the stored state broadcasts nothing;
//! real changes push a compact delta to every other connection.

use std::collections::HashMap;
use uuid::Uuid;

use crate::protocol::CursorState;

/// Latest cursor/selection per live connection in one session.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    cursors: HashMap<Uuid, Option<CursorState>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with no cursor yet.
    pub fn join(&mut self, connection_id: Uuid) {
        self.cursors.insert(connection_id, None);
    }

    /// Drop a connection's presence. Returns whether it was tracked.
    pub fn leave(&mut self, connection_id: &Uuid) -> bool {
        self.cursors.remove(connection_id).is_some()
    }

    /// Store a cursor update. Returns `true` only when the stored state
    /// actually changed — the caller broadcasts nothing otherwise.
    pub fn update(&mut self, connection_id: Uuid, cursor: CursorState) -> bool {
        match self.cursors.get_mut(&connection_id) {
            Some(slot) if slot.as_ref() == Some(&cursor) => false,
            Some(slot) => {
                *slot = Some(cursor);
                true
            }
            // Unknown connections carry no presence.
            None => false,
        }
    }

    pub fn cursor(&self, connection_id: &Uuid) -> Option<CursorState> {
        self.cursors.get(connection_id).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
