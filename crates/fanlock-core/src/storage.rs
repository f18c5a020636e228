//! Persistent blob storage boundary.
//!
//! The engine serializes its own state; a store only keeps opaque blobs
//! under binary keys. Keys are structured (kind byte plus big-endian id),
//! never concatenated strings, so id spaces cannot collide.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{error::EngineError, message::SessionId};

/// Key kind for the directory state blob.
const KIND_DIRECTORY: u8 = 0;

/// Key kind for per-session ratchet snapshots.
const KIND_SESSION: u8 = 1;

/// Storage key for the directory state blob.
pub fn directory_key() -> [u8; 1] {
    [KIND_DIRECTORY]
}

/// Storage key for one session's ratchet snapshot.
pub fn session_key(session_id: SessionId) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = KIND_SESSION;
    key[1..9].copy_from_slice(&session_id.to_be_bytes());
    key
}

/// Opaque blob store the engine persists its snapshots into.
pub trait PersistentStore: Send + Sync {
    /// Fetch the blob under a key, if present.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;

    /// Store a blob under a key, replacing any previous value.
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), EngineError>;

    /// Delete the blob under a key. Deleting a missing key is not an
    /// error.
    fn delete(&self, key: &[u8]) -> Result<(), EngineError>;
}

/// In-memory store for tests and ephemeral contexts.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Vec<u8>, Vec<u8>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.lock().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), EngineError> {
        self.lock().insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let store = MemoryStore::new();
        let key = session_key(42);

        assert_eq!(store.get(&key).unwrap(), None);

        store.put(&key, vec![1, 2, 3]).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(vec![1, 2, 3]));

        store.delete(&key).unwrap();
        assert_eq!(store.get(&key).unwrap(), None);

        // Deleting again is fine
        store.delete(&key).unwrap();
    }

    #[test]
    fn clones_share_contents() {
        let store = MemoryStore::new();
        let clone = store.clone();

        store.put(&directory_key(), vec![9]).unwrap();
        assert_eq!(clone.get(&directory_key()).unwrap(), Some(vec![9]));
    }

    #[test]
    fn session_keys_do_not_collide_with_directory_key() {
        assert_ne!(session_key(0).first(), directory_key().first());
        assert_ne!(session_key(1), session_key(2));
    }
}
