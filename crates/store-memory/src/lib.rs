//! In-memory (single node) implementation of versioned key-value storage
//! for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use netmesh_store::{ChangeEvent, ChangeKind, Version, VersionedEntry, VersionedStore};
use tokio::sync::Mutex;
use tokio::sync::broadcast;

const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, (Bytes, u64)>,
    revision: u64,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

/// In-memory versioned key-value store.
///
/// Versions are drawn from a store-wide revision counter, so every
/// committed write (including removals) carries a unique version. Change
/// events are published while the state lock is held, which keeps the feed
/// in commit order.
#[derive(Clone, Debug)]
pub struct MemoryVersionedStore {
    state: Arc<Mutex<State>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryVersionedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVersionedStore {
    /// Creates a new `MemoryVersionedStore`.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        Self {
            state: Arc::new(Mutex::new(State::default())),
            changes,
        }
    }

    fn publish(&self, event: ChangeEvent) {
        // Nobody listening is fine.
        let _ = self.changes.send(event);
    }
}

#[async_trait]
impl VersionedStore for MemoryVersionedStore {
    type Error = Error;

    async fn get<K: Into<String> + Send>(
        &self,
        key: K,
    ) -> Result<Option<VersionedEntry>, Self::Error> {
        let state = self.state.lock().await;

        Ok(state.entries.get(&key.into()).map(|(value, revision)| {
            VersionedEntry {
                value: value.clone(),
                version: Version::new(*revision),
            }
        }))
    }

    async fn put_if_absent<K: Into<String> + Send>(
        &self,
        key: K,
        value: Bytes,
    ) -> Result<bool, Self::Error> {
        let key = key.into();
        let mut state = self.state.lock().await;

        if state.entries.contains_key(&key) {
            return Ok(false);
        }

        let revision = state.next_revision();
        state.entries.insert(key.clone(), (value.clone(), revision));

        self.publish(ChangeEvent {
            key,
            kind: ChangeKind::Inserted,
            value: Some(value),
            version: Version::new(revision),
        });

        Ok(true)
    }

    async fn compare_and_set<K: Into<String> + Send>(
        &self,
        key: K,
        expected: Version,
        value: Bytes,
    ) -> Result<bool, Self::Error> {
        let key = key.into();
        let mut state = self.state.lock().await;

        match state.entries.get(&key) {
            Some((_, revision)) if *revision == expected.revision() => {}
            _ => return Ok(false),
        }

        let revision = state.next_revision();
        state.entries.insert(key.clone(), (value.clone(), revision));

        self.publish(ChangeEvent {
            key,
            kind: ChangeKind::Updated,
            value: Some(value),
            version: Version::new(revision),
        });

        Ok(true)
    }

    async fn remove<K: Into<String> + Send>(
        &self,
        key: K,
    ) -> Result<Option<Bytes>, Self::Error> {
        let key = key.into();
        let mut state = self.state.lock().await;

        let Some((value, _)) = state.entries.remove(&key) else {
            return Ok(None);
        };

        let revision = state.next_revision();

        self.publish(ChangeEvent {
            key,
            kind: ChangeKind::Removed,
            value: None,
            version: Version::new(revision),
        });

        Ok(Some(value))
    }

    async fn keys(&self) -> Result<Vec<String>, Self::Error> {
        let state = self.state.lock().await;

        Ok(state.entries.keys().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
