//! WebSocket sync client.
//!
//! Keeps a [`ClientMirror`] up to date with one server session:
//! - `open` fetches a full snapshot into a fresh mirror
//! - `execute` / `execute_speculative` submit commands and apply the reply
//! - `register_request` long-polls until the server has nothing more queued
//!
//! A mirror that falls out of step (an unreconcilable collection delta, or
//! speculative edits the server never confirmed) is reset and refilled with
//! a new snapshot.

use crate::mirror::{ClientMirror, MirrorError};
use crate::protocol::{Reply, ReplyStatus, Request};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard, RwLock};
use tokio_tungstenite::tungstenite::Message;
use viewsync_core::{CommandInstruction, InstructionError, ProtocolError, Response};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub enum ClientError {
    WebSocket(tokio_tungstenite::tungstenite::Error),
    Protocol(ProtocolError),
    /// Rejected locally before sending.
    Instruction(InstructionError),
    /// The server answered with a failure.
    Failed(String),
    Mirror(MirrorError),
    Disconnected,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            ClientError::Protocol(e) => write!(f, "Protocol error: {e}"),
            ClientError::Instruction(e) => write!(f, "Invalid command instruction: {e}"),
            ClientError::Failed(e) => write!(f, "Request failed: {e}"),
            ClientError::Mirror(e) => write!(f, "Mirror error: {e}"),
            ClientError::Disconnected => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::WebSocket(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

impl From<InstructionError> for ClientError {
    fn from(e: InstructionError) -> Self {
        ClientError::Instruction(e)
    }
}

impl From<MirrorError> for ClientError {
    fn from(e: MirrorError) -> Self {
        ClientError::Mirror(e)
    }
}

type PendingReplies = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// The sync client.
pub struct SyncClient {
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<Message>,
    pending: PendingReplies,
    next_request: AtomicU64,
    in_flight: AtomicUsize,
    mirror: Mutex<ClientMirror>,
    /// User of the last `open`, reused when resynchronising.
    user: Mutex<Option<String>>,
    resyncs: AtomicU64,
}

impl SyncClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9090`).
    ///
    /// Spawns background tasks for reading and writing WebSocket messages.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let (ws_stream, _) = match tokio_tungstenite::connect_async(url).await {
            Ok(connected) => connected,
            Err(e) => {
                *state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: route replies to their waiting requests
        let pending: PendingReplies = Arc::default();
        let reader_pending = pending.clone();
        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match Reply::decode(text.as_str()) {
                        Ok(reply) => {
                            let waiter = reader_pending
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .remove(&reply.request_id);
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(reply);
                                }
                                None => log::warn!("Reply for unknown request {}", reply.request_id),
                            }
                        }
                        Err(e) => log::warn!("Failed to decode reply: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            // Connection lost: fail every outstanding request.
            *reader_state.write().await = ConnectionState::Disconnected;
            reader_pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clear();
        });

        *state.write().await = ConnectionState::Connected;
        log::info!("Connected to {url}");

        Ok(Self {
            state,
            outgoing_tx: out_tx,
            pending,
            next_request: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            mirror: Mutex::new(ClientMirror::new()),
            user: Mutex::new(None),
            resyncs: AtomicU64::new(0),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Lock the mirror for reading or for local edits.
    pub async fn mirror(&self) -> MutexGuard<'_, ClientMirror> {
        self.mirror.lock().await
    }

    /// Number of times the mirror was rebuilt from a fresh snapshot.
    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Act as `user` and replace the mirror with a full snapshot.
    pub async fn open(&self, user: Option<&str>) -> Result<(), ClientError> {
        *self.user.lock().await = user.map(str::to_string);
        let rerequest = self.fetch_snapshot().await?;
        if rerequest {
            self.register_request().await?;
        }
        Ok(())
    }

    /// Submit a command and apply the changes that come back with it.
    pub async fn execute(&self, instruction: CommandInstruction) -> Result<ReplyStatus, ClientError> {
        instruction.check()?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.execute_inner(instruction).await;
        self.settle().await?;
        let (status, rerequest) = result?;
        if rerequest {
            self.register_request().await?;
        }
        Ok(status)
    }

    async fn execute_inner(
        &self,
        instruction: CommandInstruction,
    ) -> Result<(ReplyStatus, bool), ClientError> {
        let reply = self
            .request(|request_id| Request::ExecuteCommand {
                request_id,
                instruction,
            })
            .await?;
        let status = reply.status;
        let response = expect_response(reply)?;
        let rerequest = self.absorb(&response).await?;
        Ok((status, rerequest))
    }

    /// Apply `edit` to the mirror right away, then submit the command.
    ///
    /// Collection edits made through the mirror's speculative API inside
    /// `edit` are matched against the server's confirmation instead of
    /// being applied a second time.
    pub async fn execute_speculative<F>(
        &self,
        instruction: CommandInstruction,
        edit: F,
    ) -> Result<ReplyStatus, ClientError>
    where
        F: FnOnce(&mut ClientMirror) -> Result<(), MirrorError>,
    {
        instruction.check()?;
        let instruction_id = {
            let mut mirror = self.mirror.lock().await;
            let id = mirror.begin_instruction()?;
            let edited = edit(&mut mirror);
            mirror.end_instruction(id)?;
            if let Err(e) = edited {
                drop(mirror);
                self.resync().await?;
                return Err(e.into());
            }
            id
        };
        self.execute(instruction.with_instruction(instruction_id)).await
    }

    /// Long-poll until the server reports no further queued work.
    pub async fn register_request(&self) -> Result<(), ClientError> {
        loop {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let result = self.poll_once().await;
            self.settle().await?;
            if !result? {
                return Ok(());
            }
        }
    }

    async fn poll_once(&self) -> Result<bool, ClientError> {
        let reply = self
            .request(|request_id| Request::RegisterRequest { request_id })
            .await?;
        let response = expect_response(reply)?;
        self.absorb(&response).await
    }

    /// Close the connection.
    pub async fn disconnect(&self) {
        let _ = self.outgoing_tx.send(Message::Close(None)).await;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn request<F>(&self, build: F) -> Result<Reply, ClientError>
    where
        F: FnOnce(u64) -> Request,
    {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let text = build(request_id).encode()?;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(request_id, tx);

        if self.outgoing_tx.send(Message::Text(text.into())).await.is_err() {
            self.pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&request_id);
            return Err(ClientError::Disconnected);
        }
        rx.await.map_err(|_| ClientError::Disconnected)
    }

    /// Apply a response, resynchronising if the mirror rejects it.
    /// Returns the response's `rerequest` flag.
    async fn absorb(&self, response: &Response) -> Result<bool, ClientError> {
        let applied = self.mirror.lock().await.apply(response);
        if let Err(e) = applied {
            log::warn!("Mirror rejected server changes ({e}), refetching snapshot");
            self.resync().await?;
        }
        Ok(response.rerequest)
    }

    /// Called when a request finishes. Once nothing is in flight every
    /// speculative edit must have been confirmed.
    async fn settle(&self) -> Result<(), ClientError> {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) != 1 {
            return Ok(());
        }
        let consistent = self.mirror.lock().await.assert_consistent_when_idle();
        if let Err(e) = consistent {
            log::warn!("{e}, refetching snapshot");
            self.resync().await?;
        }
        Ok(())
    }

    async fn resync(&self) -> Result<(), ClientError> {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        // A pending rerequest is picked up by the next long-poll.
        self.fetch_snapshot().await.map(|_| ())
    }

    async fn fetch_snapshot(&self) -> Result<bool, ClientError> {
        let user = self.user.lock().await.clone();
        let reply = self
            .request(|request_id| Request::Open { request_id, user })
            .await?;
        let response = expect_response(reply)?;
        let mut mirror = self.mirror.lock().await;
        mirror.reset();
        mirror.apply(&response)?;
        Ok(response.rerequest)
    }
}

fn expect_response(reply: Reply) -> Result<Response, ClientError> {
    match reply.status {
        ReplyStatus::Failed => Err(ClientError::Failed(
            reply.error.unwrap_or_else(|| "unknown error".to_string()),
        )),
        ReplyStatus::Ok | ReplyStatus::Canceled => Ok(reply.response.unwrap_or_default()),
    }
}
