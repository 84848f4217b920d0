//! Client-side persistence for the session record
//!
//! The session record lives in key/value storage with a lifecycle of its
//! own, the way a browser's local storage outlives any single token.

use std::{collections::HashMap, error, sync::Mutex};

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "file")]
mod file;

#[cfg(feature = "file")]
#[cfg_attr(docsrs, doc(cfg(feature = "file")))]
pub use file::FileSessionStore;

/// The backing storage could not be read or written
#[derive(Debug, Error)]
#[error("session storage unavailable")]
pub struct StorageError {
    #[from]
    source: Box<dyn error::Error + Send + Sync + 'static>,
}

pub(crate) fn storage_unavailable(
    source: impl Into<Box<dyn error::Error + Send + Sync + 'static>>,
) -> StorageError {
    StorageError {
        source: source.into(),
    }
}

/// Asynchronous key/value storage for client-persisted records
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Reads the value stored under `key`, if any
    async fn load(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores `value` under `key`, replacing any previous value
    async fn save(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes the value under `key`; removing an absent key is not an error
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// An in-memory session store
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemorySessionStore {
    /// Constructs a new, empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_round_trips_and_removes() {
        let store = InMemorySessionStore::new();

        assert_eq!(store.load("k").await.unwrap(), None);

        store.save("k", "v1").await.unwrap();
        store.save("k", "v2").await.unwrap();
        assert_eq!(store.load("k").await.unwrap().as_deref(), Some("v2"));

        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert_eq!(store.load("k").await.unwrap(), None);
    }
}
