//! Per-document session actor: the serialization point of the edit pipeline.
//!
//! One session owns one `(document, tab)`: its authoritative
//! [`DocumentState`], the set of live connections, presence, and the
//! write-through to both stores. All mutation happens on a single task
//! draining a command channel — mutual exclusion per tab with no visible
//! lock, while different tabs proceed fully in parallel.
//!
//! ```text
//! submit ─► capability ─► dedup ─► transform ─► apply ─► broadcast
//!                                                  │
//!                             HotStore ◄── write-through
//!                             RetryQueue ◄── fire-and-forget log append
//! ```
//!
//! Lifecycle: `Empty → Active` on first admit, `Active → Draining` when the
//! last connection leaves (grace timer absorbs rapid reconnects),
//! `Draining → Active` on re-admit, or teardown on expiry: final snapshot,
//! unregister, stop.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use tandem_core::access::Role;
use tandem_core::document::DocumentState;
use tandem_core::engine::{transform, TransformError};
use tandem_core::op::Operation;

use crate::presence::PresenceTracker;
use crate::protocol::{CursorState, ServerFrame};
use crate::storage::{
    DurabilityEvent, HotStore, LoggedOp, OperationLog, RetryConfig, RetryQueue, SnapshotStore,
    TabKey,
};

/// Shared registry map; sessions unregister themselves on teardown.
pub(crate) type SessionMap = Arc<RwLock<HashMap<TabKey, SessionHandle>>>;

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an empty session lingers before teardown (default: 5s).
    pub grace_period: Duration,
    /// Periodic snapshot interval (default: 10 minutes).
    pub snapshot_interval: Duration,
    /// Command channel capacity (default: 256).
    pub command_capacity: usize,
    /// Per-connection outbound buffer (default: 256 frames).
    pub outbound_capacity: usize,
    /// Durable-log retry queue tuning.
    pub retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            snapshot_interval: Duration::from_secs(600),
            command_capacity: 256,
            outbound_capacity: 256,
            retry: RetryConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            grace_period: Duration::from_millis(50),
            snapshot_interval: Duration::from_millis(200),
            command_capacity: 64,
            outbound_capacity: 64,
            retry: RetryConfig::for_testing(),
        }
    }
}

/// Failures surfaced to callers of the session API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Connection-time or per-operation authorization failure.
    AccessDenied,
    /// The connection's role disallows this operation.
    PermissionDenied(Role),
    /// Malformed or out-of-range operation; session state unaffected.
    ProtocolError(String),
    /// The session actor is gone (tab tore down).
    SessionClosed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::AccessDenied => write!(f, "access denied"),
            SessionError::PermissionDenied(role) => {
                write!(f, "permission denied for role {role}")
            }
            SessionError::ProtocolError(e) => write!(f, "protocol error: {e}"),
            SessionError::SessionClosed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Point-in-time view of a session, for stats and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub content: String,
    pub version: u64,
    pub connections: usize,
}

/// Commands drained by the session actor, strictly in arrival order.
enum SessionCommand {
    Admit {
        user_id: String,
        role: Option<Role>,
        outbound: mpsc::Sender<ServerFrame>,
        reply: oneshot::Sender<Result<Uuid, SessionError>>,
    },
    Submit {
        connection_id: Uuid,
        op: Operation,
    },
    Cursor {
        connection_id: Uuid,
        cursor: CursorState,
    },
    Remove {
        connection_id: Uuid,
    },
    Restore {
        connection_id: Uuid,
        snapshot_id: u64,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// One live connection inside a session.
struct ConnectionSession {
    user_id: String,
    role: Role,
    /// Last version this connection is known to have applied; the minimum
    /// across connections bounds history truncation.
    last_known_version: u64,
    /// High-water mark for idempotent retry dedup.
    last_client_seq: u64,
    outbound: mpsc::Sender<ServerFrame>,
}

/// Cloneable handle to a session actor.
#[derive(Clone)]
pub struct SessionHandle {
    key: TabKey,
    session_id: Uuid,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn key(&self) -> &TabKey {
        &self.key
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Whether the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Register a connection. Sends the current snapshot on `outbound` and
    /// returns the assigned connection id.
    pub async fn admit(
        &self,
        user_id: impl Into<String>,
        role: Option<Role>,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Result<Uuid, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Admit {
                user_id: user_id.into(),
                role,
                outbound,
                reply,
            })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Queue an operation for the serialized submit path. Outcomes are
    /// reported on the connection's outbound channel, not here.
    pub async fn submit(&self, connection_id: Uuid, op: Operation) -> Result<(), SessionError> {
        self.tx
            .send(SessionCommand::Submit { connection_id, op })
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    pub async fn cursor(
        &self,
        connection_id: Uuid,
        cursor: CursorState,
    ) -> Result<(), SessionError> {
        self.tx
            .send(SessionCommand::Cursor {
                connection_id,
                cursor,
            })
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    pub async fn remove(&self, connection_id: Uuid) -> Result<(), SessionError> {
        self.tx
            .send(SessionCommand::Remove { connection_id })
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Owner-only: replace current state with a stored snapshot.
    pub async fn restore(
        &self,
        connection_id: Uuid,
        snapshot_id: u64,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Restore {
                connection_id,
                snapshot_id,
                reply,
            })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Stats { reply })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    /// Drain the session: final snapshot, then stop the actor.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Shutdown { reply })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }
}

/// The session actor state. Owned by exactly one task.
pub struct DocumentSession {
    key: TabKey,
    session_id: Uuid,
    config: SessionConfig,
    doc: DocumentState,
    connections: HashMap<Uuid, ConnectionSession>,
    presence: PresenceTracker,
    hot: Arc<dyn HotStore>,
    snapshots: Arc<dyn SnapshotStore>,
    retry: RetryQueue,
    sessions: SessionMap,
    last_snapshot_version: u64,
    /// Armed while the connection set is empty.
    drain_deadline: Option<Instant>,
}

impl DocumentSession {
    /// Spawn the actor for one tab and return its handle. `doc` is the
    /// recovered state (snapshot + log replay) or a fresh document.
    pub(crate) fn spawn(
        key: TabKey,
        doc: DocumentState,
        config: SessionConfig,
        hot: Arc<dyn HotStore>,
        log: Arc<dyn OperationLog>,
        snapshots: Arc<dyn SnapshotStore>,
        sessions: SessionMap,
    ) -> SessionHandle {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(config.command_capacity);
        let (durability_tx, durability_rx) = mpsc::unbounded_channel();
        let retry = RetryQueue::spawn(key.clone(), log, config.retry.clone(), durability_tx);

        let handle = SessionHandle {
            key: key.clone(),
            session_id,
            tx,
        };

        let session = DocumentSession {
            last_snapshot_version: doc.version(),
            // A freshly created session is empty: arm the grace timer so a
            // resolve with no admit still gets cleaned up.
            drain_deadline: Some(Instant::now() + config.grace_period),
            key,
            session_id,
            config,
            doc,
            connections: HashMap::new(),
            presence: PresenceTracker::new(),
            hot,
            snapshots,
            retry,
            sessions,
        };

        tokio::spawn(session.run(rx, durability_rx));
        handle
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SessionCommand>,
        mut durability_rx: mpsc::UnboundedReceiver<DurabilityEvent>,
    ) {
        log::info!("session {} started for {}", self.session_id, self.key);
        let mut snapshot_tick = tokio::time::interval(self.config.snapshot_interval);
        snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it.
        snapshot_tick.tick().await;

        loop {
            let drain_at = self
                .drain_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(SessionCommand::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle(cmd),
                    // Every handle dropped: nobody can reach us again.
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                Some(event) = durability_rx.recv() => self.handle_durability(event),
                _ = snapshot_tick.tick() => self.periodic_snapshot(),
                _ = tokio::time::sleep_until(drain_at), if self.drain_deadline.is_some() => {
                    if self.connections.is_empty() {
                        log::info!("session {} for {} drained (idle)", self.session_id, self.key);
                        self.teardown().await;
                        break;
                    }
                    self.drain_deadline = None;
                }
            }
        }
    }

    fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Admit {
                user_id,
                role,
                outbound,
                reply,
            } => {
                let _ = reply.send(self.handle_admit(user_id, role, outbound));
            }
            SessionCommand::Submit { connection_id, op } => {
                self.handle_submit(connection_id, op);
            }
            SessionCommand::Cursor {
                connection_id,
                cursor,
            } => self.handle_cursor(connection_id, cursor),
            SessionCommand::Remove { connection_id } => self.handle_remove(connection_id),
            SessionCommand::Restore {
                connection_id,
                snapshot_id,
                reply,
            } => {
                let _ = reply.send(self.handle_restore(connection_id, snapshot_id));
            }
            SessionCommand::Stats { reply } => {
                let _ = reply.send(SessionStats {
                    content: self.doc.content().to_string(),
                    version: self.doc.version(),
                    connections: self.connections.len(),
                });
            }
            SessionCommand::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    fn handle_admit(
        &mut self,
        user_id: String,
        role: Option<Role>,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Result<Uuid, SessionError> {
        // Checked upstream by the access gate; re-validated here so a
        // misrouted admit can never slip in without a role.
        let role = role.ok_or(SessionError::AccessDenied)?;

        let connection_id = Uuid::new_v4();
        let snapshot = ServerFrame::Snapshot {
            content: self.doc.content().to_string(),
            version: self.doc.version(),
        };
        if outbound.try_send(snapshot).is_err() {
            return Err(SessionError::SessionClosed);
        }

        self.broadcast_except(
            None,
            ServerFrame::Join {
                user_id: user_id.clone(),
            },
        );

        self.connections.insert(
            connection_id,
            ConnectionSession {
                user_id: user_id.clone(),
                role,
                last_known_version: self.doc.version(),
                last_client_seq: 0,
                outbound,
            },
        );
        self.presence.join(connection_id);
        self.drain_deadline = None;

        log::info!(
            "connection {connection_id} ({user_id}, {role}) admitted to {}",
            self.key
        );
        Ok(connection_id)
    }

    /// The central entry point: capability check, dedup, transform, apply,
    /// broadcast, dual write-through. Serialized with every other command
    /// on this tab by construction.
    fn handle_submit(&mut self, connection_id: Uuid, op: Operation) {
        let (role, last_client_seq, user_id) = match self.connections.get(&connection_id) {
            Some(conn) => (conn.role, conn.last_client_seq, conn.user_id.clone()),
            // Stale submit from a connection already removed.
            None => return,
        };

        if !role.may_edit_body() {
            log::debug!("rejected {:?} from {user_id} (role {role})", op.kind);
            self.send_to(
                connection_id,
                ServerFrame::Error {
                    message: format!("permission denied for role {role}"),
                },
            );
            return;
        }

        // Idempotent dedup: a retry at or below the high-water mark was
        // already applied (or deliberately dropped) — ignore it.
        if op.client_seq <= last_client_seq {
            log::debug!(
                "dropped duplicate client_seq {} from {user_id}",
                op.client_seq
            );
            return;
        }

        if let Err(e) = op.check_shape() {
            self.send_to(
                connection_id,
                ServerFrame::Error {
                    message: format!("invalid operation: {e}"),
                },
            );
            return;
        }

        let base_version = op.base_version;
        let client_seq = op.client_seq;

        // Nothing on the OT path may take the session down: a panic in
        // transform/apply rejects the operation and the session continues.
        let doc = &mut self.doc;
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(
            || -> Result<(u64, Operation), TransformError> {
                let concurrent = doc.ops_since(base_version)?;
                let mut transformed = transform(&op, concurrent);
                transformed.clamp(doc.char_len());
                let version = doc.apply(transformed.clone());
                Ok((version, transformed))
            },
        ));

        let (version, transformed) = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(TransformError::HistoryTruncated { .. })) => {
                // Internal conflict signal: force the client back in sync
                // with a fresh snapshot instead of surfacing an error.
                log::warn!(
                    "base version {base_version} predates history on {}, resyncing {}",
                    self.key,
                    connection_id
                );
                let snapshot = ServerFrame::Snapshot {
                    content: self.doc.content().to_string(),
                    version: self.doc.version(),
                };
                if let Some(conn) = self.connections.get_mut(&connection_id) {
                    conn.last_known_version = self.doc.version();
                }
                self.send_to(connection_id, snapshot);
                return;
            }
            Ok(Err(e @ TransformError::FutureBaseVersion { .. })) => {
                self.send_to(
                    connection_id,
                    ServerFrame::Error {
                        message: format!("invalid operation: {e}"),
                    },
                );
                return;
            }
            Err(_) => {
                log::error!(
                    "transform/apply panicked on {} — operation rejected, session continues",
                    self.key
                );
                self.send_to(
                    connection_id,
                    ServerFrame::Error {
                        message: "invalid operation: internal transform failure".into(),
                    },
                );
                return;
            }
        };

        if let Some(conn) = self.connections.get_mut(&connection_id) {
            conn.last_client_seq = client_seq;
            conn.last_known_version = conn.last_known_version.max(base_version);
        }

        // Echo-suppression: every connection except the originator, which
        // already has the edit applied locally.
        self.broadcast_except(Some(connection_id), ServerFrame::op(version, &transformed));
        for (id, conn) in self.connections.iter_mut() {
            if *id != connection_id {
                conn.last_known_version = version;
            }
        }

        // Write-through to the hot tier; failures are isolated to this tab
        // and the in-memory state keeps serving.
        if let Err(e) = self.hot.set(&self.key, self.doc.content(), version) {
            log::error!("hot store write failed for {}: {e}", self.key);
        }

        // Fire-and-forget durable append; the retry queue absorbs outages.
        self.retry.enqueue(LoggedOp {
            version,
            op: transformed,
        });
    }

    fn handle_cursor(&mut self, connection_id: Uuid, cursor: CursorState) {
        if !self.presence.update(connection_id, cursor) {
            return;
        }
        let Some(conn) = self.connections.get(&connection_id) else {
            return;
        };
        let frame = ServerFrame::Presence {
            user_id: conn.user_id.clone(),
            cursor: Some(cursor),
        };
        self.broadcast_except(Some(connection_id), frame);
    }

    fn handle_remove(&mut self, connection_id: Uuid) {
        let Some(conn) = self.connections.remove(&connection_id) else {
            return;
        };
        self.presence.leave(&connection_id);
        log::info!(
            "connection {connection_id} ({}) left {}",
            conn.user_id,
            self.key
        );
        self.broadcast_except(
            None,
            ServerFrame::Leave {
                user_id: conn.user_id,
            },
        );

        if self.connections.is_empty() {
            log::debug!("{} draining, teardown in {:?}", self.key, self.config.grace_period);
            self.drain_deadline = Some(Instant::now() + self.config.grace_period);
        }
    }

    fn handle_restore(
        &mut self,
        connection_id: Uuid,
        snapshot_id: u64,
    ) -> Result<(), SessionError> {
        let conn = self
            .connections
            .get(&connection_id)
            .ok_or(SessionError::SessionClosed)?;
        if !conn.role.may_restore() {
            return Err(SessionError::PermissionDenied(conn.role));
        }

        let record = self
            .snapshots
            .load_snapshot(&self.key, snapshot_id)
            .map_err(|e| SessionError::ProtocolError(e.to_string()))?;

        self.doc.restore(record.content, record.version);
        let version = self.doc.version();
        log::info!(
            "restored {} to snapshot {snapshot_id} (now at version {version})",
            self.key
        );

        if let Err(e) = self.hot.set(&self.key, self.doc.content(), version) {
            log::error!("hot store write failed for {}: {e}", self.key);
        }
        // Restored state becomes the new durable baseline right away.
        if let Err(e) = self
            .snapshots
            .save_snapshot(&self.key, version, self.doc.content())
        {
            log::warn!("post-restore snapshot failed for {}: {e}", self.key);
        } else {
            self.last_snapshot_version = version;
        }

        // Everyone reloads, including the requester.
        let frame = ServerFrame::Snapshot {
            content: self.doc.content().to_string(),
            version,
        };
        self.broadcast_except(None, frame);
        for conn in self.connections.values_mut() {
            conn.last_known_version = version;
        }
        Ok(())
    }

    fn handle_durability(&mut self, event: DurabilityEvent) {
        match event {
            DurabilityEvent::Degraded { dropped } => {
                log::warn!(
                    "durability degraded on {}: {dropped} oldest log entries dropped",
                    self.key
                );
                // Owners get the warning; degradation is never silent.
                let frame = ServerFrame::Warning {
                    message: format!(
                        "durability degraded: {dropped} oldest unflushed operations dropped"
                    ),
                };
                let owners: Vec<Uuid> = self
                    .connections
                    .iter()
                    .filter(|(_, c)| c.role == Role::Owner)
                    .map(|(id, _)| *id)
                    .collect();
                for id in owners {
                    self.send_to(id, frame.clone());
                }
            }
            DurabilityEvent::Recovered => {
                log::info!("durability recovered on {}", self.key);
            }
        }
    }

    fn periodic_snapshot(&mut self) {
        if self.doc.version() == self.last_snapshot_version {
            return;
        }
        let version = self.doc.version();
        match self
            .snapshots
            .save_snapshot(&self.key, version, self.doc.content())
        {
            Ok(snapshot_id) => {
                self.last_snapshot_version = version;
                log::debug!("periodic snapshot {snapshot_id} for {} at {version}", self.key);
                // History below the snapshot stays only as long as a
                // connected client might still submit against it.
                let floor = self
                    .connections
                    .values()
                    .map(|c| c.last_known_version)
                    .min()
                    .unwrap_or(version);
                self.doc.truncate_history(floor.min(version));
            }
            Err(e) => log::warn!("periodic snapshot failed for {}: {e}", self.key),
        }
    }

    async fn teardown(&mut self) {
        if self.doc.version() > self.last_snapshot_version {
            match self
                .snapshots
                .save_snapshot(&self.key, self.doc.version(), self.doc.content())
            {
                Ok(_) => self.last_snapshot_version = self.doc.version(),
                Err(e) => log::error!("teardown snapshot failed for {}: {e}", self.key),
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(&self.key) {
            if handle.session_id == self.session_id {
                sessions.remove(&self.key);
            }
        }
        log::info!("session {} for {} stopped", self.session_id, self.key);
    }

    /// Fan out a frame in arrival order. `except` implements
    /// echo-suppression. Slow consumers drop frames rather than stalling
    /// the serialized path; closed consumers are removed.
    fn broadcast_except(&mut self, except: Option<Uuid>, frame: ServerFrame) {
        let mut dead = Vec::new();
        for (id, conn) in self.connections.iter() {
            if Some(*id) == except {
                continue;
            }
            match conn.outbound.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "outbound buffer full for {} on {}, dropping frame",
                        conn.user_id,
                        self.key
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            self.handle_remove(id);
        }
    }

    fn send_to(&mut self, connection_id: Uuid, frame: ServerFrame) {
        let mut closed = false;
        if let Some(conn) = self.connections.get(&connection_id) {
            if let Err(mpsc::error::TrySendError::Closed(_)) = conn.outbound.try_send(frame) {
                closed = true;
            }
        }
        if closed {
            self.handle_remove(connection_id);
        }
    }
}
