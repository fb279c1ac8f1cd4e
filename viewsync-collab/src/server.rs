//! WebSocket transport for the sync endpoints.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── UserSession (alice)
//!            ├── SyncServer ── SessionManager
//! Client B ──┘      │                └── UserSession (bob)
//!                   │                        │
//!                   │                        └── SessionStorage
//!                   ▼                             ├── memory
//!            one task per connection              └── RocksDB
//!            one task per request
//! ```
//!
//! A connection acts for one principal, chosen by its latest `open`
//! request. Requests are served concurrently so that a parked
//! `registerRequest` never blocks a command on the same connection.

use crate::command::Principal;
use crate::manager::{Application, SessionManager};
use crate::protocol::{Reply, ReplyStatus, Request};
use crate::session::{Completion, SessionConfig};
use crate::storage::{MemorySessionStorage, SessionStorage, SessionStore, StoreConfig, StoreError};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections beyond this are closed on accept
    pub max_connections: usize,
    /// Per-session tuning
    pub session: SessionConfig,
    /// Session storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_connections: 1024,
            session: SessionConfig::default(),
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerError {
    Io(String),
    WebSocket(String),
    Storage(StoreError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {e}"),
            ServerError::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            ServerError::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ServerError::WebSocket(e.to_string())
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        ServerError::Storage(e)
    }
}

/// Maps the user named in an `open` request to a principal.
pub trait PrincipalResolver: Send + Sync {
    fn resolve(&self, user: Option<&str>) -> Principal;
}

/// Trusts the user name sent by the client. Missing or empty names are
/// anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamedPrincipalResolver;

impl PrincipalResolver for NamedPrincipalResolver {
    fn resolve(&self, user: Option<&str>) -> Principal {
        match user.map(str::trim) {
            Some(name) if !name.is_empty() => Principal::new(name),
            _ => Principal::anonymous(),
        }
    }
}

/// The sync server. Cheap to clone.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    manager: Arc<SessionManager>,
    resolver: Arc<dyn PrincipalResolver>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server for `app`. Opens the RocksDB store when a storage
    /// path is configured.
    pub fn new(config: ServerConfig, app: Arc<dyn Application>) -> Result<Self, ServerError> {
        let storage: Arc<dyn SessionStorage> = match &config.storage_path {
            Some(path) => Arc::new(SessionStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemorySessionStorage::new()),
        };
        let manager = SessionManager::new(app, storage, config.session);
        Ok(Self {
            config,
            manager: Arc::new(manager),
            resolver: Arc::new(NamedPrincipalResolver),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
        app: Arc<dyn Application>,
    ) -> Result<Self, ServerError> {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config, app)
    }

    pub fn with_resolver(mut self, resolver: impl PrincipalResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            {
                let mut s = self.stats.write().await;
                if s.active_connections as usize >= self.config.max_connections {
                    s.rejected_connections += 1;
                    log::warn!("Rejecting {addr}: connection limit reached");
                    continue;
                }
                s.total_connections += 1;
                s.active_connections += 1;
            }

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                server.stats.write().await.active_connections -= 1;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection_id = Uuid::new_v4();
        log::info!("WebSocket connection {connection_id} established from {addr}");

        // Writer task: replies complete out of order, so they funnel
        // through one channel.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let mut principal = self.resolver.resolve(None);

        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    {
                        let mut s = self.stats.write().await;
                        s.total_requests += 1;
                        s.total_bytes += text.len() as u64;
                    }

                    let request = match Request::decode(text.as_str()) {
                        Ok(request) => request,
                        Err(e) => {
                            log::warn!("Failed to decode request on {connection_id}: {e}");
                            self.stats.write().await.failed_requests += 1;
                            if let Some(request_id) = salvage_request_id(text.as_str()) {
                                self.send_reply(&out_tx, Reply::failed(request_id, e.to_string()));
                            }
                            continue;
                        }
                    };

                    if let Request::Open { user, .. } = &request {
                        principal = self.resolver.resolve(user.as_deref());
                        log::info!("Connection {connection_id} acts for '{}'", principal.user_key());
                    }

                    let server = self.clone();
                    let principal = principal.clone();
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        let reply = server.handle_request(&principal, request).await;
                        if reply.status == ReplyStatus::Failed {
                            server.stats.write().await.failed_requests += 1;
                        }
                        server.send_reply(&out_tx, reply);
                    });
                }
                Ok(Message::Ping(data)) => {
                    let _ = out_tx.send(Message::Pong(data));
                }
                Ok(Message::Close(_)) => {
                    log::info!("Connection {connection_id} closed by {addr}");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("WebSocket error on {connection_id}: {e}");
                    break;
                }
            }
        }

        if let Err(e) = self.manager.persist(&principal).await {
            log::error!("Failed to persist session for '{}': {e}", principal.user_key());
        }
        Ok(())
    }

    async fn handle_request(&self, principal: &Principal, request: Request) -> Reply {
        let request_id = request.request_id();
        let result = match request {
            Request::Open { .. } => self.manager.open(principal).await.map(|r| Reply::ok(request_id, r)),
            Request::ExecuteCommand { instruction, .. } => self
                .manager
                .execute_command(principal, instruction)
                .await
                .map(|(completion, response)| match completion {
                    Completion::Executed => Reply::ok(request_id, response),
                    Completion::Canceled => Reply::canceled(request_id, response),
                }),
            Request::RegisterRequest { .. } => self
                .manager
                .register_request(principal)
                .await
                .map(|r| Reply::ok(request_id, r)),
        };
        result.unwrap_or_else(|e| Reply::failed(request_id, e.to_string()))
    }

    fn send_reply(&self, out_tx: &mpsc::UnboundedSender<Message>, reply: Reply) {
        match reply.encode() {
            Ok(text) => {
                // The connection may already be gone.
                let _ = out_tx.send(Message::Text(text.into()));
            }
            Err(e) => log::error!("Failed to encode reply {}: {e}", reply.request_id),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }
}

/// Best-effort `requestId` of a frame that failed to decode.
fn salvage_request_id(text: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("requestId")?
        .as_u64()
}
