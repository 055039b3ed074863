use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use netmesh_intent::{IntentKey, IntentService, MeshIntent};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::membership::HostSet;

#[derive(Debug, Default)]
struct State {
    /// Outstanding intents per network.
    tracked: HashMap<String, HashSet<MeshIntent>>,

    /// Networks whose intent set may disagree with membership after an
    /// intent-service failure. Cleared by `resync`.
    pending: HashSet<String>,
}

/// Keeps the derived full-mesh intent set consistent with membership.
///
/// Membership is the source of truth; intents are eventually consistent
/// with it. When the intent service is unreachable mid-reconciliation the
/// affected network is marked pending and [`MeshReconciler::resync`]
/// recomputes the expected mesh from membership and repairs the
/// difference, so recovery never depends on having executed every step.
#[derive(Clone, Debug)]
pub struct MeshReconciler<I>
where
    I: IntentService,
{
    intents: I,
    owner: String,
    state: Arc<Mutex<State>>,
}

impl<I> MeshReconciler<I>
where
    I: IntentService,
{
    /// Creates a new `MeshReconciler` submitting intents under `owner`.
    pub fn new(intents: I, owner: String) -> Self {
        Self {
            intents,
            owner,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Submits an intent from `host` to every other member of `network`.
    /// Pairs whose canonical key is already outstanding are skipped, so
    /// replays are safe. Returns how many intents were submitted.
    pub async fn on_host_added(
        &self,
        network: &str,
        host: &str,
        hosts_after: &HostSet,
    ) -> Result<usize, I::Error> {
        let mut state = self.state.lock().await;
        let tracked = state.tracked.entry(network.to_string()).or_default();

        let missing: Vec<MeshIntent> = hosts_after
            .iter()
            .filter(|other| *other != host)
            .map(|other| MeshIntent::between(network, host, other))
            .filter(|intent| !tracked.contains(intent))
            .collect();

        let mut submitted = 0;

        for intent in missing {
            if let Err(error) = self.intents.submit(intent.clone(), &self.owner).await {
                state.pending.insert(network.to_string());
                warn!(network, host, "intent submission failed, marked for resync");
                return Err(error);
            }

            debug!(network, key = %intent.key, "submitted intent");
            if let Some(tracked) = state.tracked.get_mut(network) {
                tracked.insert(intent);
            }
            submitted += 1;
        }

        Ok(submitted)
    }

    /// Withdraws every outstanding intent with `host` as an endpoint.
    /// Returns how many intents were withdrawn.
    pub async fn on_host_removed(&self, network: &str, host: &str) -> Result<usize, I::Error> {
        let mut state = self.state.lock().await;

        let victims: Vec<MeshIntent> = state
            .tracked
            .get(network)
            .map(|tracked| {
                tracked
                    .iter()
                    .filter(|intent| intent.involves(host))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut withdrawn = 0;

        for intent in victims {
            if let Err(error) = self.intents.withdraw(&intent.key).await {
                state.pending.insert(network.to_string());
                warn!(network, host, "intent withdrawal failed, marked for resync");
                return Err(error);
            }

            debug!(network, key = %intent.key, "withdrew intent");
            if let Some(tracked) = state.tracked.get_mut(network) {
                tracked.remove(&intent);
            }
            withdrawn += 1;
        }

        Ok(withdrawn)
    }

    /// Bulk-withdraws every outstanding intent for `network`. Returns how
    /// many intents were withdrawn.
    pub async fn on_network_removed(&self, network: &str) -> Result<usize, I::Error> {
        let mut state = self.state.lock().await;
        let victims = state.tracked.remove(network).unwrap_or_default();
        let mut withdrawn = 0;

        for intent in victims {
            if let Err(error) = self.intents.withdraw(&intent.key).await {
                state.pending.insert(network.to_string());
                warn!(network, "bulk intent withdrawal failed, marked for resync");
                return Err(error);
            }

            withdrawn += 1;
        }

        debug!(network, withdrawn, "withdrew network intents");

        Ok(withdrawn)
    }

    /// Recomputes the expected mesh for every network from authoritative
    /// membership, diffs it against what the intent service reports as
    /// active, and submits/withdraws the difference. Replaces the tracked
    /// state and clears pending marks.
    pub async fn resync(
        &self,
        memberships: &HashMap<String, HostSet>,
    ) -> Result<(), I::Error> {
        let mut state = self.state.lock().await;

        let mut expected: HashMap<IntentKey, MeshIntent> = HashMap::new();
        for (network, hosts) in memberships {
            for intent in full_mesh(network, hosts) {
                expected.insert(intent.key.clone(), intent);
            }
        }

        let active: HashSet<IntentKey> = self
            .intents
            .active_keys(&self.owner)
            .await?
            .into_iter()
            .collect();

        let mut submitted = 0;
        for (key, intent) in &expected {
            if !active.contains(key) {
                self.intents.submit(intent.clone(), &self.owner).await?;
                submitted += 1;
            }
        }

        let mut withdrawn = 0;
        for key in &active {
            if !expected.contains_key(key) {
                self.intents.withdraw(key).await?;
                withdrawn += 1;
            }
        }

        let mut tracked: HashMap<String, HashSet<MeshIntent>> = HashMap::new();
        for intent in expected.into_values() {
            tracked
                .entry(intent.network.clone())
                .or_default()
                .insert(intent);
        }

        state.tracked = tracked;
        state.pending.clear();

        info!(submitted, withdrawn, "reconciled intents against membership");

        Ok(())
    }

    /// Withdraws everything submitted under this reconciler's owner tag
    /// and forgets the tracked state.
    pub async fn withdraw_all(&self) -> Result<(), I::Error> {
        let mut state = self.state.lock().await;

        self.intents.withdraw_all(&self.owner).await?;
        state.tracked.clear();
        state.pending.clear();

        Ok(())
    }

    /// Networks marked for resync after an intent-service failure.
    pub async fn pending(&self) -> Vec<String> {
        self.state.lock().await.pending.iter().cloned().collect()
    }

    /// Number of intents currently tracked for `network`.
    pub async fn tracked_count(&self, network: &str) -> usize {
        self.state
            .lock()
            .await
            .tracked
            .get(network)
            .map_or(0, HashSet::len)
    }
}

/// Every unordered host pair in `hosts`, as canonical intents.
fn full_mesh(network: &str, hosts: &HostSet) -> Vec<MeshIntent> {
    let members: Vec<&str> = hosts.iter().collect();
    let mut mesh = Vec::new();

    for (i, one) in members.iter().enumerate() {
        for two in &members[i + 1..] {
            mesh.push(MeshIntent::between(network, one, two));
        }
    }

    mesh
}

#[cfg(test)]
mod tests {
    use super::*;

    use netmesh_intent_memory::MemoryIntentService;

    fn hosts(ids: &[&str]) -> HostSet {
        ids.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_first_host_creates_no_intents() {
        let service = MemoryIntentService::new();
        let reconciler = MeshReconciler::new(service.clone(), "test".to_string());

        let submitted = reconciler
            .on_host_added("lab", "h1", &hosts(&["h1"]))
            .await
            .unwrap();

        assert_eq!(submitted, 0);
        assert!(service.active().await.is_empty());
    }

    #[tokio::test]
    async fn test_mesh_grows_pairwise() {
        let service = MemoryIntentService::new();
        let reconciler = MeshReconciler::new(service.clone(), "test".to_string());

        reconciler
            .on_host_added("lab", "h1", &hosts(&["h1"]))
            .await
            .unwrap();
        reconciler
            .on_host_added("lab", "h2", &hosts(&["h1", "h2"]))
            .await
            .unwrap();
        let submitted = reconciler
            .on_host_added("lab", "h3", &hosts(&["h1", "h2", "h3"]))
            .await
            .unwrap();

        assert_eq!(submitted, 2);
        assert_eq!(service.active().await.len(), 3);
        assert_eq!(reconciler.tracked_count("lab").await, 3);
    }

    #[tokio::test]
    async fn test_removal_withdraws_only_matching_endpoints() {
        let service = MemoryIntentService::new();
        let reconciler = MeshReconciler::new(service.clone(), "test".to_string());

        for (host, members) in [
            ("h1", vec!["h1"]),
            ("h2", vec!["h1", "h2"]),
            ("h3", vec!["h1", "h2", "h3"]),
        ] {
            reconciler
                .on_host_added("lab", host, &hosts(&members))
                .await
                .unwrap();
        }

        let withdrawn = reconciler.on_host_removed("lab", "h2").await.unwrap();

        assert_eq!(withdrawn, 2);
        let remaining = service.active().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, MeshIntent::between("lab", "h1", "h3").key);
    }

    #[tokio::test]
    async fn test_network_removal_is_a_bulk_withdraw() {
        let service = MemoryIntentService::new();
        let reconciler = MeshReconciler::new(service.clone(), "test".to_string());

        for (host, members) in [
            ("h1", vec!["h1"]),
            ("h2", vec!["h1", "h2"]),
            ("h3", vec!["h1", "h2", "h3"]),
        ] {
            reconciler
                .on_host_added("lab", host, &hosts(&members))
                .await
                .unwrap();
        }

        let withdrawn = reconciler.on_network_removed("lab").await.unwrap();

        assert_eq!(withdrawn, 3);
        assert!(service.active().await.is_empty());
        assert_eq!(reconciler.tracked_count("lab").await, 0);
    }

    #[tokio::test]
    async fn test_resync_repairs_drift() {
        let service = MemoryIntentService::new();
        let reconciler = MeshReconciler::new(service.clone(), "test".to_string());

        // An intent the mesh does not call for, and a missing mesh.
        service
            .submit(MeshIntent::between("lab", "h1", "zombie"), "test")
            .await
            .unwrap();

        let memberships =
            HashMap::from([("lab".to_string(), hosts(&["h1", "h2", "h3"]))]);

        reconciler.resync(&memberships).await.unwrap();

        let active = service.active().await;
        assert_eq!(active.len(), 3);
        assert!(!active.iter().any(|intent| intent.involves("zombie")));
        assert_eq!(reconciler.tracked_count("lab").await, 3);
    }
}
