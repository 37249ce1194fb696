use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::engines::EngineKind;

pub type UserId = i64;

/// Per-user chat state: the selected engine and the most recently
/// submitted prompt. Created lazily, removed only by an explicit reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub engine: EngineKind,
    pub last_prompt: Option<String>,
}

/// Sole owner of the user-to-session mapping. Clones share the map;
/// every mutation is atomic under the inner lock.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<UserId, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<UserId, Session>> {
        // A poisoned map is still internally consistent; take it.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get_or_create(&self, user: UserId) -> Session {
        self.map().entry(user).or_default().clone()
    }

    pub fn get(&self, user: UserId) -> Option<Session> {
        self.map().get(&user).cloned()
    }

    pub fn set_engine(&self, user: UserId, engine: EngineKind) {
        self.map().entry(user).or_default().engine = engine;
    }

    pub fn set_last_prompt(&self, user: UserId, prompt: &str) {
        self.map().entry(user).or_default().last_prompt = Some(prompt.to_string());
    }

    pub fn reset(&self, user: UserId) {
        self.map().remove(&user);
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
