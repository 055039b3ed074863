//! Replicated named-network membership registry with change notification
//! and automatic full-mesh connectivity-intent reconciliation.
//!
//! Membership lives in a versioned key-value store and is mutated with
//! bounded compare-and-set loops; connectivity intents are derived state,
//! kept eventually consistent with membership by the reconciler.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod event;
mod membership;
mod notifier;
mod reconciler;

pub use error::{Error, MembershipError};
pub use event::{NetworkEvent, NetworkEventKind, NetworkListener};
pub use membership::{HostSet, MembershipStore};
pub use notifier::{EventNotifier, ListenerId};
pub use reconciler::MeshReconciler;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use netmesh_intent::{HOST_SEPARATOR, IntentService, IntentServiceError, NETWORK_SEPARATOR};
use netmesh_store::{StoreError, VersionedStore};
use tracing::info;

/// Options for creating a new `NetworkManager`.
pub struct NetworkManagerConfig {
    /// Tag under which intents are submitted to the intent service, so
    /// recovery and bulk withdrawal only touch intents this registry owns.
    pub owner_tag: String,

    /// How many times a membership read-modify-write may retry on version
    /// conflict before surfacing `Contention`.
    pub max_update_retries: u32,
}

impl Default for NetworkManagerConfig {
    fn default() -> Self {
        Self {
            owner_tag: "netmesh".to_string(),
            max_update_retries: 8,
        }
    }
}

/// Trait for administering named networks and their host membership.
#[async_trait]
pub trait NetworkManagement
where
    Self: Clone + Send + Sync + 'static,
{
    /// The underlying store's error type.
    type SE: StoreError;

    /// The underlying intent service's error type.
    type IE: IntentServiceError;

    /// Creates a network. Returns whether it was created; creating an
    /// existing network is a no-op.
    async fn create_network(&self, network: &str) -> Result<bool, Error<Self::SE, Self::IE>>;

    /// Deletes a network, withdrawing every connectivity intent derived
    /// from it first.
    async fn remove_network(&self, network: &str) -> Result<(), Error<Self::SE, Self::IE>>;

    /// Snapshot of all current network names.
    async fn networks(&self) -> Result<Vec<String>, Error<Self::SE, Self::IE>>;

    /// Adds a host to a network, submitting mesh intents connecting it to
    /// every existing member. Returns whether the host was added.
    async fn add_host(&self, network: &str, host: &str)
    -> Result<bool, Error<Self::SE, Self::IE>>;

    /// Removes a host from a network, withdrawing its mesh intents.
    /// Returns whether the host was removed.
    async fn remove_host(
        &self,
        network: &str,
        host: &str,
    ) -> Result<bool, Error<Self::SE, Self::IE>>;

    /// Snapshot of the hosts in a network.
    async fn hosts(&self, network: &str) -> Result<HostSet, Error<Self::SE, Self::IE>>;

    /// Rebuilds the intent set from membership: recomputes the expected
    /// mesh for every network and repairs the difference against what the
    /// intent service reports active. Run at startup and after any
    /// `IntentSync` error.
    async fn resync(&self) -> Result<(), Error<Self::SE, Self::IE>>;

    /// Registers a network event listener.
    fn subscribe(&self, listener: Arc<dyn NetworkListener>) -> ListenerId;

    /// Removes a network event listener.
    fn unsubscribe(&self, id: ListenerId) -> bool;
}

/// Orchestrates the membership store, the mesh reconciler, and the event
/// notifier. This is the single entry point external callers use.
#[derive(Clone, Debug)]
pub struct NetworkManager<S, I>
where
    S: VersionedStore,
    I: IntentService,
{
    membership: MembershipStore<S>,
    reconciler: MeshReconciler<I>,
    notifier: EventNotifier,
}

impl<S, I> NetworkManager<S, I>
where
    S: VersionedStore,
    I: IntentService,
{
    /// Creates a new `NetworkManager` and starts forwarding store changes
    /// to the notifier.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: S, intents: I, notifier: EventNotifier, config: NetworkManagerConfig) -> Self {
        let membership = MembershipStore::new(store, config.max_update_retries);
        let reconciler = MeshReconciler::new(intents, config.owner_tag);

        membership.forward_changes(notifier.clone());

        info!("network manager started");

        Self {
            membership,
            reconciler,
            notifier,
        }
    }

    /// Withdraws every intent this registry owns and forgets the tracked
    /// state. Used on teardown.
    pub async fn withdraw_all_intents(&self) -> Result<(), Error<S::Error, I::Error>> {
        self.reconciler.withdraw_all().await.map_err(Error::Intent)
    }

    /// Networks whose intents are marked for resync after an
    /// intent-service failure.
    pub async fn pending_resync(&self) -> Vec<String> {
        self.reconciler.pending().await
    }
}

#[async_trait]
impl<S, I> NetworkManagement for NetworkManager<S, I>
where
    S: VersionedStore,
    I: IntentService,
{
    type SE = S::Error;
    type IE = I::Error;

    async fn create_network(&self, network: &str) -> Result<bool, Error<Self::SE, Self::IE>> {
        validate_network(network)?;

        let created = self.membership.create_network(network).await?;

        if created {
            info!(network, "created network");
        }

        Ok(created)
    }

    async fn remove_network(&self, network: &str) -> Result<(), Error<Self::SE, Self::IE>> {
        validate_network(network)?;

        // Existence check up front; intents must be withdrawn before the
        // membership entry disappears, never after.
        self.membership.hosts(network).await?;

        self.reconciler
            .on_network_removed(network)
            .await
            .map_err(|source| Error::IntentSync {
                network: network.to_string(),
                source,
            })?;

        self.membership.remove_network(network).await?;

        info!(network, "removed network");

        Ok(())
    }

    async fn networks(&self) -> Result<Vec<String>, Error<Self::SE, Self::IE>> {
        Ok(self.membership.networks().await?)
    }

    async fn add_host(
        &self,
        network: &str,
        host: &str,
    ) -> Result<bool, Error<Self::SE, Self::IE>> {
        validate_network(network)?;
        validate_host(host)?;

        if !self.membership.add_host(network, host).await? {
            return Ok(false);
        }

        let hosts_after = self.membership.hosts(network).await?;

        let submitted = self
            .reconciler
            .on_host_added(network, host, &hosts_after)
            .await
            .map_err(|source| Error::IntentSync {
                network: network.to_string(),
                source,
            })?;

        info!(network, host, submitted, "added host");

        Ok(true)
    }

    async fn remove_host(
        &self,
        network: &str,
        host: &str,
    ) -> Result<bool, Error<Self::SE, Self::IE>> {
        validate_network(network)?;
        validate_host(host)?;

        if !self.membership.remove_host(network, host).await? {
            return Ok(false);
        }

        let withdrawn = self
            .reconciler
            .on_host_removed(network, host)
            .await
            .map_err(|source| Error::IntentSync {
                network: network.to_string(),
                source,
            })?;

        info!(network, host, withdrawn, "removed host");

        Ok(true)
    }

    async fn hosts(&self, network: &str) -> Result<HostSet, Error<Self::SE, Self::IE>> {
        validate_network(network)?;

        Ok(self.membership.hosts(network).await?)
    }

    async fn resync(&self) -> Result<(), Error<Self::SE, Self::IE>> {
        let mut memberships = HashMap::new();

        for network in self.membership.networks().await? {
            match self.membership.hosts(&network).await {
                Ok(hosts) => {
                    memberships.insert(network, hosts);
                }
                // Deleted while we were scanning; the diff handles it.
                Err(MembershipError::NetworkNotFound(_)) => {}
                Err(error) => return Err(error.into()),
            }
        }

        self.reconciler
            .resync(&memberships)
            .await
            .map_err(Error::Intent)
    }

    fn subscribe(&self, listener: Arc<dyn NetworkListener>) -> ListenerId {
        self.notifier.subscribe(listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.notifier.unsubscribe(id)
    }
}

fn validate_network<SE, IE>(network: &str) -> Result<(), Error<SE, IE>>
where
    SE: StoreError,
    IE: IntentServiceError,
{
    if network.is_empty() || network.contains(NETWORK_SEPARATOR) {
        return Err(Error::InvalidName(network.to_string()));
    }

    Ok(())
}

fn validate_host<SE, IE>(host: &str) -> Result<(), Error<SE, IE>>
where
    SE: StoreError,
    IE: IntentServiceError,
{
    if host.is_empty() || host.contains(HOST_SEPARATOR) || host.contains(NETWORK_SEPARATOR) {
        return Err(Error::InvalidHost(host.to_string()));
    }

    Ok(())
}
