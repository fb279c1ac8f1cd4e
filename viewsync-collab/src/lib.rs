//! # viewsync-collab: sessions, commands and transport for viewsync
//!
//! Serves per-user view graphs over WebSocket. Clients send command
//! instructions, the server runs them one at a time per session, and every
//! resulting change flows back to the client's mirror.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────┐   ┌──────────────┐
//! │ClientMirror │                     │SessionManager│──►│SessionStorage│
//! │+ Reconciler │                     └──────┬───────┘   │(mem / rocks) │
//! └─────────────┘                            │           └──────────────┘
//!                                     ┌──────┴──────┐
//!                                     │ UserSession │
//!                                     │ queue→worker│
//!                                     │ view, waiter│
//!                                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`queue`]: Single-flight processing queue
//! - [`waiter`]: Coalescing long-poll waiter with backoff
//! - [`condition`]: Client-evaluable command preconditions
//! - [`command`]: Command dispatch table and principals
//! - [`session`]: Per-user command pipeline and change delivery
//! - [`manager`]: Session cache and the open/execute/poll endpoints
//! - [`storage`]: Session persistence (in-memory, RocksDB)
//! - [`protocol`]: JSON request/reply framing
//! - [`server`]: WebSocket server
//! - [`mirror`] / [`reconciler`]: Client replica and speculative edits
//! - [`client`]: WebSocket sync client

pub mod client;
pub mod command;
pub mod condition;
pub mod manager;
pub mod mirror;
pub mod protocol;
pub mod queue;
pub mod reconciler;
pub mod server;
pub mod session;
pub mod storage;
pub mod waiter;

// Re-exports for convenience
pub use client::{ClientError, ConnectionState, SyncClient};
pub use command::{
    Command, CommandDescriptor, CommandError, CommandManager, FnCommand, Invocation, Principal,
};
pub use condition::{Condition, ConditionError};
pub use manager::{Application, ManagerStats, SessionManager};
pub use mirror::{ClientMirror, MirrorError, MirrorKey, MirrorValue};
pub use protocol::{Reply, ReplyStatus, Request};
pub use queue::{ProcessingQueue, QueueError, QueueStats};
pub use reconciler::{CollectionReconciler, PendingEdit, ReconcileError};
pub use server::{
    NamedPrincipalResolver, PrincipalResolver, ServerConfig, ServerError, ServerStats, SyncServer,
};
pub use session::{
    AppRoot, CommandFailure, Completion, PendingCommand, SessionConfig, SessionError,
    SessionStats, UserSession,
};
pub use storage::{
    MemorySessionStorage, SessionData, SessionMetadata, SessionStorage, SessionStore, StoreConfig,
    StoreError,
};
pub use waiter::{AtMostOneAwaiter, WaitOutcome, WaiterConfig, WaiterError};
