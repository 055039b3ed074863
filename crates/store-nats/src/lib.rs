//! Implementation of versioned key-value storage using NATS JetStream KV
//! with HA replication. Bucket revisions back the version tokens, so
//! compare-and-set maps onto JetStream's expected-revision updates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashSet;
use std::time::Duration;

use async_nats::Client;
use async_nats::jetstream;
use async_nats::jetstream::Context as JetStreamContext;
use async_nats::jetstream::kv::{Config, CreateErrorKind, Operation, Store as KvStore};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use netmesh_store::{ChangeEvent, ChangeKind, Version, VersionedEntry, VersionedStore};
use tokio::sync::broadcast;
use tracing::warn;

const CHANGE_FEED_CAPACITY: usize = 256;

/// JetStream reports a lost compare-and-set race with err code 10071;
/// async-nats surfaces it as a generic update error, so the message text
/// is the only discriminator available.
const WRONG_LAST_SEQUENCE: &str = "wrong last sequence";

/// Options for configuring a `NatsVersionedStore`.
pub struct NatsVersionedStoreOptions {
    /// The NATS client to use.
    pub client: Client,

    /// The bucket to use for the key-value store.
    pub bucket: String,

    /// The maximum age of entries in the store. Use `Duration::ZERO` for no expiry.
    pub max_age: Duration,

    /// Whether to persist the store to disk.
    pub persist: bool,
}

/// Versioned KV store using NATS JetStream.
#[derive(Clone, Debug)]
pub struct NatsVersionedStore {
    bucket: String,
    client: Client,
    jetstream_context: JetStreamContext,
    max_age: Duration,
    persist: bool,
    changes: broadcast::Sender<ChangeEvent>,
}

impl NatsVersionedStore {
    /// Creates a new `NatsVersionedStore` with the specified options and
    /// starts the change-feed watcher.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        NatsVersionedStoreOptions {
            client,
            bucket,
            max_age,
            persist,
        }: NatsVersionedStoreOptions,
    ) -> Self {
        let jetstream_context = jetstream::new(client.clone());
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        let store = Self {
            bucket,
            client,
            jetstream_context,
            max_age,
            persist,
            changes,
        };

        tokio::spawn(store.clone().watch_changes());

        store
    }

    async fn get_kv_store(&self) -> Result<KvStore, Error> {
        let config = Config {
            bucket: self.bucket.clone(),
            max_age: self.max_age,
            storage: if self.persist {
                jetstream::stream::StorageType::File
            } else {
                jetstream::stream::StorageType::Memory
            },
            ..Default::default()
        };

        self.jetstream_context
            .create_key_value(config)
            .await
            .map_err(|e| Error::CreateKeyValue(e.kind()))
    }

    /// Pumps the JetStream watch into the broadcast feed. The watcher
    /// tracks live keys to classify puts as inserts or updates, since the
    /// wire protocol only distinguishes put from delete.
    async fn watch_changes(self) {
        loop {
            if let Err(error) = self.run_watcher().await {
                warn!(bucket = %self.bucket, ?error, "kv watcher failed; restarting");
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn run_watcher(&self) -> Result<(), Error> {
        let kv = self.get_kv_store().await?;

        let mut live: HashSet<String> = kv
            .keys()
            .await
            .map_err(|e| Error::History(e.kind()))?
            .filter_map(|key| async move { key.ok() })
            .collect()
            .await;

        let mut watch = kv.watch_all().await.map_err(|e| Error::Watch(e.kind()))?;

        while let Some(entry) = watch.next().await {
            let Ok(entry) = entry else {
                continue;
            };

            let event = match entry.operation {
                Operation::Put => {
                    let kind = if live.insert(entry.key.clone()) {
                        ChangeKind::Inserted
                    } else {
                        ChangeKind::Updated
                    };

                    ChangeEvent {
                        key: entry.key,
                        kind,
                        value: Some(entry.value),
                        version: Version::new(entry.revision),
                    }
                }
                Operation::Delete | Operation::Purge => {
                    live.remove(&entry.key);

                    ChangeEvent {
                        key: entry.key,
                        kind: ChangeKind::Removed,
                        value: None,
                        version: Version::new(entry.revision),
                    }
                }
            };

            let _ = self.changes.send(event);
        }

        Ok(())
    }
}

#[async_trait]
impl VersionedStore for NatsVersionedStore {
    type Error = Error;

    async fn get<K: Into<String> + Send>(
        &self,
        key: K,
    ) -> Result<Option<VersionedEntry>, Self::Error> {
        let entry = self
            .get_kv_store()
            .await?
            .entry(key.into())
            .await
            .map_err(|e| Error::Entry(e.kind()))?;

        Ok(entry.and_then(|entry| match entry.operation {
            Operation::Put => Some(VersionedEntry {
                value: entry.value,
                version: Version::new(entry.revision),
            }),
            Operation::Delete | Operation::Purge => None,
        }))
    }

    async fn put_if_absent<K: Into<String> + Send>(
        &self,
        key: K,
        value: Bytes,
    ) -> Result<bool, Self::Error> {
        match self.get_kv_store().await?.create(key.into(), value).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == CreateErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::Create(e.kind())),
        }
    }

    async fn compare_and_set<K: Into<String> + Send>(
        &self,
        key: K,
        expected: Version,
        value: Bytes,
    ) -> Result<bool, Self::Error> {
        match self
            .get_kv_store()
            .await?
            .update(key.into(), value, expected.revision())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.to_string().contains(WRONG_LAST_SEQUENCE) => Ok(false),
            Err(e) => Err(Error::Update(e.kind())),
        }
    }

    async fn remove<K: Into<String> + Send>(
        &self,
        key: K,
    ) -> Result<Option<Bytes>, Self::Error> {
        let key = key.into();
        let kv = self.get_kv_store().await?;

        // The delete is guarded by the revision just read, so a write
        // landing between the read and the delete survives and we retry
        // against the new revision instead of destroying it.
        loop {
            let entry = kv
                .entry(key.clone())
                .await
                .map_err(|e| Error::Entry(e.kind()))?;

            let Some(entry) = entry else {
                return Ok(None);
            };

            if !matches!(entry.operation, Operation::Put) {
                return Ok(None);
            }

            match kv
                .delete_expect_revision(key.clone(), Some(entry.revision))
                .await
            {
                Ok(()) => return Ok(Some(entry.value)),
                Err(e) if e.to_string().contains(WRONG_LAST_SEQUENCE) => {}
                Err(e) => return Err(Error::Delete(e.kind())),
            }
        }
    }

    async fn keys(&self) -> Result<Vec<String>, Self::Error> {
        Ok(self
            .get_kv_store()
            .await?
            .keys()
            .await
            .map_err(|e| Error::History(e.kind()))?
            .filter_map(|key| async move { key.ok() })
            .collect()
            .await)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
