//! Page-scoped key/value storage holding the auth snapshot.

use crate::client::{lock, types::StoredAuth};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::warn;

/// Key shared with the exchange page.
pub const AUTH_STORAGE_KEY: &str = "ssogate:auth";

pub trait AuthStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

/// In-memory storage. Clones share the same entries, the way tabs of one
/// origin share `localStorage`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        lock(&self.entries).insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        lock(&self.entries).remove(key);
    }
}

/// Read the snapshot. Unparseable data is treated as absent and removed.
pub fn load_auth(storage: &dyn AuthStorage) -> Option<StoredAuth> {
    let raw = storage.get(AUTH_STORAGE_KEY)?;
    match serde_json::from_str(&raw) {
        Ok(stored) => Some(stored),
        Err(err) => {
            warn!("Discarding unreadable auth snapshot: {}", err);
            storage.remove(AUTH_STORAGE_KEY);
            None
        }
    }
}

pub fn save_auth(storage: &dyn AuthStorage, stored: &StoredAuth) {
    match serde_json::to_string(stored) {
        Ok(raw) => storage.set(AUTH_STORAGE_KEY, raw),
        Err(err) => warn!("Failed to persist auth snapshot: {}", err),
    }
}

pub fn clear_auth(storage: &dyn AuthStorage) {
    storage.remove(AUTH_STORAGE_KEY);
}
