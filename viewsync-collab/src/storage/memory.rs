//! In-process session storage, for tests and single-node demos.

use super::{SessionData, SessionStorage, StoreError};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    sessions: RwLock<HashMap<String, SessionData>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStorage for MemorySessionStorage {
    fn try_open(&self, user_key: &str) -> Result<Option<SessionData>, StoreError> {
        Ok(self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_key)
            .cloned())
    }

    fn create_or_update(&self, user_key: &str, data: &SessionData) -> Result<(), StoreError> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_key.to_string(), data.clone());
        Ok(())
    }

    fn delete(&self, user_key: &str) -> Result<(), StoreError> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_key);
        Ok(())
    }
}
