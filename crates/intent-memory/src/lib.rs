//! In-memory (single node) implementation of the connectivity intent
//! service for local development and tests. Keeps an operation log so
//! tests can assert exactly which submissions and withdrawals happened.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use netmesh_intent::{IntentKey, IntentService, MeshIntent};
use tokio::sync::Mutex;

/// One entry in the operation log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    /// An intent became active.
    Submitted(IntentKey),

    /// An active intent was withdrawn.
    Withdrawn(IntentKey),
}

#[derive(Debug, Default)]
struct State {
    active: HashMap<IntentKey, (MeshIntent, String)>,
    log: Vec<Operation>,
    submit_failures: u32,
}

/// In-memory intent service.
#[derive(Clone, Debug, Default)]
pub struct MemoryIntentService {
    state: Arc<Mutex<State>>,
}

impl MemoryIntentService {
    /// Creates a new `MemoryIntentService`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Returns the intents currently active, regardless of owner.
    pub async fn active(&self) -> Vec<MeshIntent> {
        let state = self.state.lock().await;

        state
            .active
            .values()
            .map(|(intent, _)| intent.clone())
            .collect()
    }

    /// Returns the operation log in arrival order.
    pub async fn operations(&self) -> Vec<Operation> {
        self.state.lock().await.log.clone()
    }

    /// Makes the next `count` submissions fail, simulating an unreachable
    /// intent service so callers can exercise their recovery paths.
    pub async fn inject_submit_failures(&self, count: u32) {
        self.state.lock().await.submit_failures = count;
    }
}

#[async_trait]
impl IntentService for MemoryIntentService {
    type Error = Error;

    async fn submit(&self, intent: MeshIntent, owner: &str) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;

        if state.submit_failures > 0 {
            state.submit_failures -= 1;
            return Err(Error);
        }

        // Re-submitting an outstanding key is a no-op; the log records
        // only transitions.
        if state.active.contains_key(&intent.key) {
            return Ok(());
        }

        state.log.push(Operation::Submitted(intent.key.clone()));
        state
            .active
            .insert(intent.key.clone(), (intent, owner.to_string()));

        Ok(())
    }

    async fn withdraw(&self, key: &IntentKey) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;

        if state.active.remove(key).is_some() {
            state.log.push(Operation::Withdrawn(key.clone()));
        }

        Ok(())
    }

    async fn withdraw_all(&self, owner: &str) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;

        let keys: Vec<IntentKey> = state
            .active
            .iter()
            .filter(|(_, (_, intent_owner))| intent_owner == owner)
            .map(|(key, _)| key.clone())
            .collect();

        for key in keys {
            state.active.remove(&key);
            state.log.push(Operation::Withdrawn(key));
        }

        Ok(())
    }

    async fn active_keys(&self, owner: &str) -> Result<Vec<IntentKey>, Self::Error> {
        let state = self.state.lock().await;

        Ok(state
            .active
            .iter()
            .filter(|(_, (_, intent_owner))| intent_owner == owner)
            .map(|(key, _)| key.clone())
            .collect())
    }
}
