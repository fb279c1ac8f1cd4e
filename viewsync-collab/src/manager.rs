//! Session cache, application factory and the three sync endpoints.
//!
//! ```text
//!  open(principal) ─────────────┐
//!  execute_command(principal) ──┼─► get_or_create ─► cache ─┬─ hit ─► UserSession
//!  register_request(principal) ─┘                           └─ miss ─► storage ─► Application::create
//! ```

use crate::command::Principal;
use crate::session::{AppRoot, Completion, SessionConfig, SessionError, UserSession};
use crate::storage::{MemorySessionStorage, SessionData, SessionStorage};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use viewsync_core::{CommandInstruction, Response, View};

/// Application-specific view-model factory.
pub trait Application: Send + Sync {
    /// Build the root graph and register its commands. `stored` is the
    /// state last returned by [`Application::save`], if any.
    fn create(&self, stored: Option<&SessionData>) -> Result<AppRoot, SessionError>;

    /// Serialize the session's state for storage. `None` means there is
    /// nothing worth persisting.
    fn save(&self, _view: &View) -> Option<SessionData> {
        None
    }
}

/// Manager counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub created: u64,
    pub restored: u64,
    pub persisted: u64,
}

pub struct SessionManager {
    app: Arc<dyn Application>,
    storage: Arc<dyn SessionStorage>,
    config: SessionConfig,
    sessions: RwLock<HashMap<String, UserSession>>,
    created: AtomicU64,
    restored: AtomicU64,
    persisted: AtomicU64,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SessionManager {
    pub fn new(
        app: Arc<dyn Application>,
        storage: Arc<dyn SessionStorage>,
        config: SessionConfig,
    ) -> Self {
        Self {
            app,
            storage,
            config,
            sessions: RwLock::new(HashMap::new()),
            created: AtomicU64::new(0),
            restored: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
        }
    }

    /// Manager backed by [`MemorySessionStorage`].
    pub fn in_memory(app: Arc<dyn Application>, config: SessionConfig) -> Self {
        Self::new(app, Arc::new(MemorySessionStorage::new()), config)
    }

    pub fn storage(&self) -> &Arc<dyn SessionStorage> {
        &self.storage
    }

    pub async fn get_cached(&self, principal: &Principal) -> Option<UserSession> {
        self.sessions.read().await.get(principal.user_key()).cloned()
    }

    /// Rebuild a session from storage. Does not touch the cache.
    pub fn get_stored(&self, principal: &Principal) -> Result<Option<UserSession>, SessionError> {
        let stored = self
            .storage
            .try_open(principal.user_key())
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        match stored {
            Some(data) => {
                let session = self.build(Some(&data))?;
                self.restored.fetch_add(1, Ordering::Relaxed);
                info!("Restored session for '{}' from storage", principal.user_key());
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Cached session, else a stored one (which is then cached).
    pub async fn get_cached_or_stored(
        &self,
        principal: &Principal,
    ) -> Result<Option<UserSession>, SessionError> {
        if let Some(session) = self.get_cached(principal).await {
            return Ok(Some(session));
        }
        let mut sessions = self.sessions.write().await;
        // Another request may have restored it meanwhile.
        if let Some(session) = sessions.get(principal.user_key()) {
            return Ok(Some(session.clone()));
        }
        let restored = self.get_stored(principal)?;
        if let Some(session) = &restored {
            sessions.insert(principal.user_key().to_string(), session.clone());
        }
        Ok(restored)
    }

    /// Existing session, or a fresh one built from the factory's default.
    pub async fn get_or_create(&self, principal: &Principal) -> Result<UserSession, SessionError> {
        if let Some(session) = self.get_cached_or_stored(principal).await? {
            return Ok(session);
        }
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(principal.user_key()) {
            return Ok(session.clone());
        }
        let session = self.build(None)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        info!("Created session for '{}'", principal.user_key());
        sessions.insert(principal.user_key().to_string(), session.clone());
        Ok(session)
    }

    /// Save the cached session's state. Returns whether anything was written.
    pub async fn persist(&self, principal: &Principal) -> Result<bool, SessionError> {
        match self.get_cached(principal).await {
            Some(session) => self.persist_session(principal.user_key(), &session),
            None => Ok(false),
        }
    }

    /// Save every cached session. Returns how many were written.
    pub async fn persist_all(&self) -> Result<usize, SessionError> {
        let sessions: Vec<(String, UserSession)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(key, session)| (key.clone(), session.clone()))
            .collect();
        let mut written = 0;
        for (key, session) in &sessions {
            if self.persist_session(key, session)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Persist and drop the cached session.
    pub async fn evict(&self, principal: &Principal) -> Result<Option<UserSession>, SessionError> {
        let removed = self.sessions.write().await.remove(principal.user_key());
        if let Some(session) = &removed {
            self.persist_session(principal.user_key(), session)?;
            debug!("Evicted session for '{}'", principal.user_key());
        }
        Ok(removed)
    }

    /// Drop a user's session from the cache and from storage.
    pub async fn delete(&self, principal: &Principal) -> Result<(), SessionError> {
        self.sessions.write().await.remove(principal.user_key());
        self.storage
            .delete(principal.user_key())
            .map_err(|e| SessionError::Storage(e.to_string()))
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            created: self.created.load(Ordering::Relaxed),
            restored: self.restored.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
        }
    }

    // ─── Endpoints ────────────────────────────────────────────────────

    /// Full-state snapshot of the principal's (possibly new) session.
    pub async fn open(&self, principal: &Principal) -> Result<Response, SessionError> {
        let session = self.get_or_create(principal).await?;
        let response = session.open()?;
        debug!(
            "Opened session for '{}' with {} changes",
            principal.user_key(),
            response.changes.len()
        );
        Ok(response)
    }

    /// Submit an instruction, await it, then return the pending changes.
    ///
    /// The first letter of the command name is upper-cased, so clients may
    /// send `increment` for `Increment`.
    pub async fn execute_command(
        &self,
        principal: &Principal,
        mut instruction: CommandInstruction,
    ) -> Result<(Completion, Response), SessionError> {
        let session = self.get_or_create(principal).await?;
        instruction.command_name = to_first_upper(&instruction.command_name);
        let completion = session.execute_command(instruction, principal)?.await.map_err(|e| {
            warn!("Command for '{}' failed: {e}", principal.user_key());
            SessionError::Command(e)
        })?;
        Ok((completion, session.flush_or_wait().await))
    }

    /// Long-poll for changes.
    pub async fn register_request(&self, principal: &Principal) -> Result<Response, SessionError> {
        let session = self.get_or_create(principal).await?;
        Ok(session.flush_or_wait().await)
    }

    fn build(&self, stored: Option<&SessionData>) -> Result<UserSession, SessionError> {
        let root: AppRoot = self.app.create(stored)?;
        UserSession::new(root, self.config)
    }

    fn persist_session(&self, user_key: &str, session: &UserSession) -> Result<bool, SessionError> {
        let Some(data) = session.with_view(|view| self.app.save(view)) else {
            return Ok(false);
        };
        self.storage
            .create_or_update(user_key, &data)
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        self.persisted.fetch_add(1, Ordering::Relaxed);
        debug!("Persisted session for '{user_key}' ({} bytes)", data.len());
        Ok(true)
    }
}

fn to_first_upper(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
