//! Abstract interface for a consistent versioned key-value store with
//! compare-and-set writes and a change feed.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

/// Marker trait for `VersionedStore` errors.
pub trait StoreError: Debug + Error + Send + Sync + 'static {}

/// Opaque version token returned with every read and required for
/// conditional writes.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Version(u64);

impl Version {
    /// Wraps a raw revision number.
    #[must_use]
    pub const fn new(revision: u64) -> Self {
        Self(revision)
    }

    /// Returns the raw revision number.
    #[must_use]
    pub const fn revision(self) -> u64 {
        self.0
    }
}

/// A stored value together with the version it was read at.
#[derive(Clone, Debug)]
pub struct VersionedEntry {
    /// The stored bytes.
    pub value: Bytes,

    /// The version of the entry at read time.
    pub version: Version,
}

/// How an entry changed, as observed by the change feed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeKind {
    /// The key was written for the first time.
    Inserted,

    /// An existing key was overwritten.
    Updated,

    /// The key was removed.
    Removed,
}

/// A single change observed on the store, whether written locally or by a
/// remote process sharing the same replicated store.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    /// The key that changed.
    pub key: String,

    /// What happened to the key.
    pub kind: ChangeKind,

    /// The new value, or `None` for removals.
    pub value: Option<Bytes>,

    /// The version the entry moved to (for removals, the version of the
    /// delete operation itself).
    pub version: Version,
}

/// A trait representing a linearizable per-key versioned store.
///
/// Every read returns the version of the entry; writes other than the
/// initial insert are conditional on the version read immediately prior,
/// which is what makes read-modify-write loops safe against concurrent
/// writers (local or remote).
#[async_trait]
pub trait VersionedStore: Clone + Send + Sync + 'static {
    /// The error type for store operations.
    type Error: StoreError;

    /// Retrieves the value and version for a key, or `None` if absent.
    async fn get<K: Into<String> + Send>(
        &self,
        key: K,
    ) -> Result<Option<VersionedEntry>, Self::Error>;

    /// Inserts the value only if the key is currently absent. Returns
    /// whether the insert took place.
    async fn put_if_absent<K: Into<String> + Send>(
        &self,
        key: K,
        value: Bytes,
    ) -> Result<bool, Self::Error>;

    /// Replaces the value only if the entry is still at `expected`.
    /// Returns `false` on version conflict (a concurrent writer won).
    async fn compare_and_set<K: Into<String> + Send>(
        &self,
        key: K,
        expected: Version,
        value: Bytes,
    ) -> Result<bool, Self::Error>;

    /// Removes the entry, returning the removed value if it was present.
    async fn remove<K: Into<String> + Send>(
        &self,
        key: K,
    ) -> Result<Option<Bytes>, Self::Error>;

    /// Retrieves all keys currently in the store.
    async fn keys(&self) -> Result<Vec<String>, Self::Error>;

    /// Subscribes to the change feed. Events arrive in per-key commit
    /// order and cover writes from every process sharing the store.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
