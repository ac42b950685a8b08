//! WebSocket gateway in front of the session registry.
//!
//! ```text
//! Client A ──┐  handshake: ?documentId&tabId&userId
//!             ├── AccessGate ── SessionRegistry ── DocumentSession
//! Client B ──┘                                        │
//!                                        ┌────────────┼────────────┐
//!                                        ▼            ▼            ▼
//!                                     HotStore   OperationLog  Snapshots
//! ```
//!
//! One task per connection: inbound JSON frames become session commands;
//! the session's outbound channel is pumped back as text frames, in order.
//! Tabs are rehydrated lazily — the first resolve for a key loads the
//! latest snapshot and replays the log tail above it.
//!
//! Close codes: 4001 access denied, 4002 protocol error, 1000 normal.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use tandem_core::access::authorize;

use crate::acl::AccessProvider;
use crate::protocol::{
    ClientFrame, CursorState, ServerFrame, WireError, CLOSE_ACCESS_DENIED, CLOSE_PROTOCOL_ERROR,
};
use crate::registry::SessionRegistry;
use crate::session::SessionConfig;
use crate::storage::{
    HotStore, MemoryHotStore, MemoryOpLog, MemorySnapshotStore, OperationLog, RocksStore,
    SnapshotStore, StoreConfig, StoreError, TabKey,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Durable storage path (None = in-memory only).
    pub storage_path: Option<PathBuf>,
    /// Per-session tuning.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9800".to_string(),
            storage_path: None,
            session: SessionConfig::default(),
        }
    }
}

/// Server-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub active_sessions: usize,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    acl: Arc<dyn AccessProvider>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Build the server: durable tier from `storage_path` (RocksDB) or
    /// in-memory stores, plus the in-memory hot tier.
    pub fn new(config: ServerConfig, acl: Arc<dyn AccessProvider>) -> Result<Self, StoreError> {
        let hot: Arc<dyn HotStore> = Arc::new(MemoryHotStore::new());
        let (log, snapshots): (Arc<dyn OperationLog>, Arc<dyn SnapshotStore>) =
            match &config.storage_path {
                Some(path) => {
                    let store = Arc::new(RocksStore::open(StoreConfig {
                        path: path.clone(),
                        ..StoreConfig::default()
                    })?);
                    (store.clone(), store)
                }
                None => (
                    Arc::new(MemoryOpLog::new()),
                    Arc::new(MemorySnapshotStore::new()),
                ),
            };

        let registry = Arc::new(SessionRegistry::new(
            config.session.clone(),
            hot,
            log,
            snapshots,
        ));

        Ok(Self {
            config,
            registry,
            acl,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("tcp connection from {addr}");

            let registry = self.registry.clone();
            let acl = self.acl.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, acl, stats).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.registry.session_count().await;
        stats
    }

    /// Drain all sessions for clean process exit.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

/// Required handshake parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectionParams {
    document_id: String,
    tab_id: String,
    user_id: String,
}

impl ConnectionParams {
    fn from_query(query: Option<&str>) -> Result<Self, WireError> {
        let mut params = parse_query(query.unwrap_or(""));
        let mut take = |name: &'static str| -> Result<String, WireError> {
            match params.remove(name) {
                Some(v) if !v.is_empty() => Ok(v),
                _ => Err(WireError::MissingParam(name)),
            }
        };
        Ok(Self {
            document_id: take("documentId")?,
            tab_id: take("tabId")?,
            user_id: take("userId")?,
        })
    }

    fn tab_key(&self) -> TabKey {
        TabKey::new(self.document_id.clone(), self.tab_id.clone())
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    acl: Arc<dyn AccessProvider>,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Capture the request URI during the handshake; the query string
    // carries documentId / tabId / userId.
    let mut request_uri = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
         resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
            request_uri = Some(req.uri().clone());
            Ok(resp)
        },
    )
    .await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    // Balance the counter however this connection ends.
    let _active_guard = ActiveGuard(stats.clone());

    let query = request_uri.as_ref().and_then(|uri| uri.query());
    let params = match ConnectionParams::from_query(query) {
        Ok(params) => params,
        Err(e) => {
            log::warn!("handshake from {addr} rejected: {e}");
            send_error_and_close(&mut ws_tx, &e.to_string(), CLOSE_PROTOCOL_ERROR).await;
            return Ok(());
        }
    };

    // Access gate: policy snapshot from the collaborator, pure decision.
    let policy = acl.policy_for(&params.document_id, &params.user_id);
    let Some(role) = authorize(&policy, &params.user_id) else {
        log::info!(
            "access denied for {} on {} from {addr}",
            params.user_id,
            params.document_id
        );
        send_error_and_close(&mut ws_tx, "access denied", CLOSE_ACCESS_DENIED).await;
        return Ok(());
    };

    let key = params.tab_key();
    let session = match registry.resolve(&key).await {
        Ok(session) => session,
        Err(e) => {
            log::error!("session resolve failed for {key}: {e}");
            send_error_and_close(&mut ws_tx, "service unavailable", CLOSE_PROTOCOL_ERROR).await;
            return Ok(());
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(256);
    let connection_id = match session.admit(params.user_id.as_str(), Some(role), out_tx).await {
        Ok(id) => id,
        Err(e) => {
            send_error_and_close(&mut ws_tx, &e.to_string(), CLOSE_ACCESS_DENIED).await;
            return Ok(());
        }
    };

    log::info!(
        "{} connected to {key} as {role} (connection {connection_id})",
        params.user_id
    );

    loop {
        tokio::select! {
            // Session → client, in broadcast order.
            frame = out_rx.recv() => match frame {
                Some(frame) => {
                    let json = frame.encode()?;
                    ws_tx.send(Message::Text(json.into())).await?;
                }
                // Session tore down underneath us.
                None => break,
            },

            // Client → session.
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    {
                        let mut s = stats.write().await;
                        s.total_frames += 1;
                    }
                    match ClientFrame::decode(text.as_str()) {
                        Ok(ClientFrame::Cursor { position, selection_end }) => {
                            let cursor = CursorState { position, selection_end };
                            if session.cursor(connection_id, cursor).await.is_err() {
                                break;
                            }
                        }
                        Ok(frame) => {
                            // Edit frames always lower to an operation.
                            let Some(op) = frame.into_operation(connection_id) else {
                                continue;
                            };
                            if session.submit(connection_id, op).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!("malformed frame from {addr}: {e}");
                            send_error_and_close(
                                &mut ws_tx,
                                &e.to_string(),
                                CLOSE_PROTOCOL_ERROR,
                            )
                            .await;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    ws_tx.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::debug!("websocket error from {addr}: {e}");
                    break;
                }
                _ => {}
            },
        }
    }

    let _ = session.remove(connection_id).await;
    log::info!("{} disconnected from {key}", params.user_id);
    Ok(())
}

/// Send an error frame, then close with the given library code.
async fn send_error_and_close<S>(ws_tx: &mut S, message: &str, code: u16)
where
    S: futures_util::Sink<Message> + Unpin,
{
    let frame = ServerFrame::Error {
        message: message.to_string(),
    };
    if let Ok(json) = frame.encode() {
        let _ = ws_tx.send(Message::Text(json.into())).await;
    }
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Library(code),
            reason: message.to_string().into(),
        })))
        .await;
}

/// Decrements `active_connections` when the connection task ends.
struct ActiveGuard(Arc<RwLock<ServerStats>>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let stats = self.0.clone();
        tokio::spawn(async move {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        });
    }
}
