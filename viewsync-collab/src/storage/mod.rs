//! Session persistence.
//!
//! ```text
//! ┌────────────────┐  save / restore  ┌─────────────────────────────┐
//! │ SessionManager │ ───────────────► │ dyn SessionStorage          │
//! └────────────────┘                  │  ├─ MemorySessionStorage     │
//!                                     │  └─ SessionStore (RocksDB)   │
//!                                     │      CF "sessions": lz4 blob │
//!                                     │      CF "metadata": bincode  │
//!                                     └─────────────────────────────┘
//! ```
//!
//! The stored blob is opaque: applications decide what a session's state
//! is and how to rebuild a graph from it.

pub mod memory;
pub mod rocks;

pub use memory::MemorySessionStorage;
pub use rocks::{SessionMetadata, SessionStore, StoreConfig, StoreError};

/// Opaque serialized session state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionData(pub Vec<u8>);

impl SessionData {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Persistent storage keyed by user key.
pub trait SessionStorage: Send + Sync {
    /// Stored state for `user_key`, if any.
    fn try_open(&self, user_key: &str) -> Result<Option<SessionData>, StoreError>;

    fn create_or_update(&self, user_key: &str, data: &SessionData) -> Result<(), StoreError>;

    /// Remove stored state. Deleting a missing key is not an error.
    fn delete(&self, user_key: &str) -> Result<(), StoreError>;
}
