//! Abstract interface for the point-to-point connectivity intent service,
//! plus the canonical order-independent keys that make intent submission
//! and withdrawal idempotent.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Marker trait for `IntentService` errors.
pub trait IntentServiceError: Debug + Error + Send + Sync + 'static {}

/// Separates the network name from the host pair in a canonical key.
/// Network names must not contain this character.
pub const NETWORK_SEPARATOR: char = ',';

/// Separates the two host ids in a canonical key. Host ids must not
/// contain this character.
pub const HOST_SEPARATOR: char = '~';

/// Deterministic, order-independent identifier for an unordered host pair
/// within a network: `"{network},{min}~{max}"`.
///
/// Two requests for the same pair always derive the identical key, so the
/// key alone is enough to submit, look up, and withdraw an intent without
/// tracking service-assigned ids.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct IntentKey(String);

impl IntentKey {
    fn derive(network: &str, one: &str, two: &str) -> Self {
        // `one` and `two` are already in lexicographic order here.
        Self(format!(
            "{network}{NETWORK_SEPARATOR}{one}{HOST_SEPARATOR}{two}"
        ))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IntentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One undirected connectivity request between two hosts of the same
/// network. The pair is canonicalized so that `one < two` under
/// lexicographic order.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct MeshIntent {
    /// Canonical key for the pair.
    pub key: IntentKey,

    /// The network both hosts belong to.
    pub network: String,

    /// The lexicographically lesser host id.
    pub one: String,

    /// The lexicographically greater host id.
    pub two: String,
}

impl MeshIntent {
    /// Builds the intent for an unordered pair of distinct hosts,
    /// canonicalizing the endpoint order.
    #[must_use]
    pub fn between(network: &str, a: &str, b: &str) -> Self {
        let (one, two) = if a < b { (a, b) } else { (b, a) };

        Self {
            key: IntentKey::derive(network, one, two),
            network: network.to_string(),
            one: one.to_string(),
            two: two.to_string(),
        }
    }

    /// Whether either endpoint of this intent is `host`.
    #[must_use]
    pub fn involves(&self, host: &str) -> bool {
        self.one == host || self.two == host
    }
}

/// A trait representing the external connectivity intent service.
///
/// Submission and withdrawal are idempotent by canonical key: submitting
/// an already-outstanding key or withdrawing an absent one is a silent
/// no-op, never an error.
#[async_trait]
pub trait IntentService: Clone + Send + Sync + 'static {
    /// The error type for intent operations.
    type Error: IntentServiceError;

    /// Requests connectivity between the intent's two hosts.
    async fn submit(&self, intent: MeshIntent, owner: &str) -> Result<(), Self::Error>;

    /// Withdraws the intent with the given key, if outstanding.
    async fn withdraw(&self, key: &IntentKey) -> Result<(), Self::Error>;

    /// Withdraws every intent submitted under `owner`.
    async fn withdraw_all(&self, owner: &str) -> Result<(), Self::Error>;

    /// Reports the keys currently active for `owner`. Used by recovery to
    /// diff the expected mesh against reality.
    async fn active_keys(&self, owner: &str) -> Result<Vec<IntentKey>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_order_independent() {
        let key = MeshIntent::between("test", "00:01", "00:02").key;
        let reverse = MeshIntent::between("test", "00:02", "00:01").key;
        let diff_host = MeshIntent::between("test", "00:01", "00:03").key;
        let diff_net = MeshIntent::between("test2", "00:01", "00:02").key;

        assert_eq!(key, reverse);
        assert_ne!(key, diff_host);
        assert_ne!(key, diff_net);
    }

    #[test]
    fn key_format_is_stable() {
        let intent = MeshIntent::between("lab", "b-host", "a-host");

        assert_eq!(intent.key.as_str(), "lab,a-host~b-host");
        assert_eq!(intent.one, "a-host");
        assert_eq!(intent.two, "b-host");
    }

    #[test]
    fn involves_matches_either_endpoint() {
        let intent = MeshIntent::between("lab", "h1", "h2");

        assert!(intent.involves("h1"));
        assert!(intent.involves("h2"));
        assert!(!intent.involves("h3"));
    }
}
