//! # tandem-collab — real-time collaborative document backend
//!
//! Many clients edit the same document tab concurrently over WebSockets;
//! the server converges every replica onto one authoritative state while
//! broadcasting low-latency updates (content, cursors, presence) to
//! everyone else watching the tab.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (JSON)   ┌──────────────┐
//! │   Client    │ ◄──────────────────► │ CollabServer │
//! │ (per user)  │                      │  (gateway)   │
//! └─────────────┘                      └──────┬───────┘
//!                                             │ AccessGate
//!                                             ▼
//!                                   ┌──────────────────┐
//!                                   │ SessionRegistry  │ one session per
//!                                   └────────┬─────────┘ (document, tab)
//!                                            ▼
//!                                   ┌──────────────────┐
//!                                   │ DocumentSession  │ serialize → OT →
//!                                   │ (actor task)     │ apply → fan out
//!                                   └───┬──────────┬───┘
//!                                       │          │
//!                                 HotStore    RetryQueue ─► OperationLog
//!                               (in-memory)   (bounded)      (RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames and close codes
//! - [`session`] — per-tab session actor (transform, apply, broadcast)
//! - [`registry`] — one live session per tab, lazy create, idle GC
//! - [`presence`] — cursor/selection tracking with diffing
//! - [`storage`] — hybrid persistence: hot store, operation log, snapshots
//! - [`acl`] — access-control collaborator interface
//! - [`server`] — WebSocket gateway

pub mod acl;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

pub use acl::{AccessProvider, StaticAcl};
pub use presence::PresenceTracker;
pub use protocol::{
    ClientFrame, CursorState, OpBody, ServerFrame, WireError, CLOSE_ACCESS_DENIED,
    CLOSE_PROTOCOL_ERROR,
};
pub use registry::SessionRegistry;
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use session::{SessionConfig, SessionError, SessionHandle, SessionStats};
pub use storage::{
    DurabilityEvent, HotStore, LoggedOp, MemoryHotStore, MemoryOpLog, MemorySnapshotStore,
    OperationLog, RetryConfig, RocksStore, SnapshotRecord, SnapshotStore, StoreConfig,
    StoreError, TabKey, TabMetadata,
};
