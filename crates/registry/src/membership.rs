use std::collections::BTreeSet;

use bytes::Bytes;
use netmesh_store::{ChangeKind, VersionedStore};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::MembershipError;
use crate::event::{NetworkEvent, NetworkEventKind};
use crate::notifier::EventNotifier;

/// The hosts belonging to one network. A `BTreeSet` keeps the encoded
/// bytes deterministic, which keeps redundant CAS writes byte-identical.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct HostSet(BTreeSet<String>);

impl HostSet {
    /// Whether `host` is a member.
    #[must_use]
    pub fn contains(&self, host: &str) -> bool {
        self.0.contains(host)
    }

    /// Number of member hosts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the network currently has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the member host ids in lexicographic order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    fn insert(&mut self, host: &str) -> bool {
        self.0.insert(host.to_string())
    }

    fn remove(&mut self, host: &str) -> bool {
        self.0.remove(host)
    }
}

impl FromIterator<String> for HostSet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for HostSet {
    type Item = String;
    type IntoIter = std::collections::btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl TryFrom<Bytes> for HostSet {
    type Error = ciborium::de::Error<std::io::Error>;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        let reader = bytes.as_ref();
        ciborium::de::from_reader(reader)
    }
}

impl TryInto<Bytes> for HostSet {
    type Error = ciborium::ser::Error<std::io::Error>;

    fn try_into(self) -> Result<Bytes, Self::Error> {
        let mut writer = Vec::new();
        ciborium::ser::into_writer(&self, &mut writer)?;
        Ok(Bytes::from(writer))
    }
}

/// The replicated network-to-hosts mapping.
///
/// Mutations never use read-then-unconditional-write: every host change is
/// a bounded read-modify-CAS loop guarded by the version read immediately
/// prior, so overlapping writers (local or remote) cannot lose updates.
#[derive(Clone, Debug)]
pub struct MembershipStore<S>
where
    S: VersionedStore,
{
    store: S,
    max_update_retries: u32,
}

impl<S> MembershipStore<S>
where
    S: VersionedStore,
{
    /// Creates a new `MembershipStore` on top of a versioned store.
    pub const fn new(store: S, max_update_retries: u32) -> Self {
        Self {
            store,
            max_update_retries,
        }
    }

    /// Inserts `network` with an empty host set if absent. Returns whether
    /// the network was created; an existing network is left untouched.
    pub async fn create_network(
        &self,
        network: &str,
    ) -> Result<bool, MembershipError<S::Error>> {
        let empty = encode(network, HostSet::default())?;

        self.store
            .put_if_absent(network, empty)
            .await
            .map_err(MembershipError::Store)
    }

    /// Removes `network`, returning the hosts it held.
    pub async fn remove_network(
        &self,
        network: &str,
    ) -> Result<HostSet, MembershipError<S::Error>> {
        let removed = self
            .store
            .remove(network)
            .await
            .map_err(MembershipError::Store)?;

        match removed {
            Some(bytes) => decode(network, bytes),
            None => Err(MembershipError::NetworkNotFound(network.to_string())),
        }
    }

    /// Snapshot of all current network names.
    pub async fn networks(&self) -> Result<Vec<String>, MembershipError<S::Error>> {
        self.store.keys().await.map_err(MembershipError::Store)
    }

    /// Snapshot of the hosts in `network`.
    pub async fn hosts(&self, network: &str) -> Result<HostSet, MembershipError<S::Error>> {
        let entry = self
            .store
            .get(network)
            .await
            .map_err(MembershipError::Store)?;

        match entry {
            Some(entry) => decode(network, entry.value),
            None => Err(MembershipError::NetworkNotFound(network.to_string())),
        }
    }

    /// Adds `host` to `network`. Returns `false` without writing if the
    /// host is already a member.
    pub async fn add_host(
        &self,
        network: &str,
        host: &str,
    ) -> Result<bool, MembershipError<S::Error>> {
        self.update(network, |hosts| hosts.insert(host)).await
    }

    /// Removes `host` from `network`. Returns whether anything changed.
    pub async fn remove_host(
        &self,
        network: &str,
        host: &str,
    ) -> Result<bool, MembershipError<S::Error>> {
        self.update(network, |hosts| hosts.remove(host)).await
    }

    /// Bounded optimistic read-modify-write. `mutate` reports whether it
    /// changed the set; an unchanged set short-circuits without a write
    /// (and therefore without an event).
    async fn update<F>(
        &self,
        network: &str,
        mut mutate: F,
    ) -> Result<bool, MembershipError<S::Error>>
    where
        F: FnMut(&mut HostSet) -> bool,
    {
        for attempt in 0..self.max_update_retries {
            let entry = self
                .store
                .get(network)
                .await
                .map_err(MembershipError::Store)?
                .ok_or_else(|| MembershipError::NetworkNotFound(network.to_string()))?;

            let mut hosts = decode(network, entry.value)?;

            if !mutate(&mut hosts) {
                return Ok(false);
            }

            let committed = self
                .store
                .compare_and_set(network, entry.version, encode(network, hosts)?)
                .await
                .map_err(MembershipError::Store)?;

            if committed {
                return Ok(true);
            }

            debug!(network, attempt, "version conflict, retrying");
        }

        Err(MembershipError::Contention(network.to_string()))
    }

    /// Forwards the store's change feed to the notifier as domain events.
    /// Remote writers are observed identically to local ones.
    pub fn forward_changes(&self, notifier: EventNotifier) -> JoinHandle<()> {
        let mut changes = self.store.subscribe();

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let kind = match change.kind {
                            ChangeKind::Inserted => NetworkEventKind::Added,
                            ChangeKind::Updated => NetworkEventKind::Updated,
                            ChangeKind::Removed => NetworkEventKind::Removed,
                        };

                        notifier.publish(NetworkEvent {
                            kind,
                            network: change.key,
                            version: change.version,
                        });
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "change feed lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn encode<SE>(network: &str, hosts: HostSet) -> Result<Bytes, MembershipError<SE>>
where
    SE: netmesh_store::StoreError,
{
    hosts
        .try_into()
        .map_err(|e: ciborium::ser::Error<std::io::Error>| {
            MembershipError::Codec(network.to_string(), e.to_string())
        })
}

fn decode<SE>(network: &str, bytes: Bytes) -> Result<HostSet, MembershipError<SE>>
where
    SE: netmesh_store::StoreError,
{
    bytes
        .try_into()
        .map_err(|e: ciborium::de::Error<std::io::Error>| {
            MembershipError::Codec(network.to_string(), e.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use netmesh_store_memory::MemoryVersionedStore;

    fn store() -> MembershipStore<MemoryVersionedStore> {
        MembershipStore::new(MemoryVersionedStore::new(), 8)
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let membership = store();

        assert!(membership.create_network("lab").await.unwrap());
        assert!(!membership.create_network("lab").await.unwrap());
        assert!(membership.hosts("lab").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_host_requires_network() {
        let membership = store();

        let result = membership.add_host("nope", "h1").await;

        assert!(matches!(
            result,
            Err(MembershipError::NetworkNotFound(name)) if name == "nope"
        ));
        assert!(membership.networks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_add_reports_unchanged() {
        let membership = store();
        membership.create_network("lab").await.unwrap();

        assert!(membership.add_host("lab", "h1").await.unwrap());
        assert!(!membership.add_host("lab", "h1").await.unwrap());
        assert_eq!(membership.hosts("lab").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_network_returns_hosts() {
        let membership = store();
        membership.create_network("lab").await.unwrap();
        membership.add_host("lab", "h1").await.unwrap();

        let removed = membership.remove_network("lab").await.unwrap();

        assert!(removed.contains("h1"));
        assert!(matches!(
            membership.hosts("lab").await,
            Err(MembershipError::NetworkNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_adds_do_not_lose_updates() {
        let membership = store();
        membership.create_network("lab").await.unwrap();

        let a = {
            let membership = membership.clone();
            tokio::spawn(async move { membership.add_host("lab", "hA").await })
        };
        let b = {
            let membership = membership.clone();
            tokio::spawn(async move { membership.add_host("lab", "hB").await })
        };

        assert!(a.await.unwrap().unwrap());
        assert!(b.await.unwrap().unwrap());

        let hosts = membership.hosts("lab").await.unwrap();
        assert!(hosts.contains("hA"));
        assert!(hosts.contains("hB"));
        assert_eq!(hosts.len(), 2);
    }
}
