use netmesh_intent::IntentServiceError;
use netmesh_store::StoreError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error<SE, IE>
where
    SE: StoreError,
    IE: IntentServiceError,
{
    /// The network name is empty or contains a reserved separator.
    /// Rejected before any store access; never retried.
    #[error("invalid network name: {0:?}")]
    InvalidName(String),

    /// The host id is empty or contains a reserved separator.
    #[error("invalid host id: {0:?}")]
    InvalidHost(String),

    /// The named network does not exist; create it first.
    #[error("network {0:?} does not exist")]
    NetworkNotFound(String),

    /// The conditional-write retry budget was exhausted. Transient; the
    /// whole operation is safe to retry.
    #[error("conflicting writers on network {0:?}, retry budget exhausted")]
    Contention(String),

    /// A stored host set failed to decode.
    #[error("host set for network {0:?} is corrupt: {1}")]
    Codec(String, String),

    /// Membership committed but intent reconciliation could not reach the
    /// intent service. Partial success: membership is the source of truth
    /// and a later `resync` replays the missing intent operations.
    #[error("intents for network {network:?} are out of sync with membership")]
    IntentSync {
        /// The network whose intents need reconciling.
        network: String,

        /// The intent service failure.
        #[source]
        source: IE,
    },

    /// Errors passed through from the underlying versioned store.
    #[error(transparent)]
    Store(SE),

    /// Errors passed through from the underlying intent service.
    #[error(transparent)]
    Intent(IE),
}

/// Membership-layer subset of the error taxonomy, so the membership store
/// does not need to know about the intent service's error type.
#[derive(Debug, Error)]
pub enum MembershipError<SE>
where
    SE: StoreError,
{
    /// The named network does not exist.
    #[error("network {0:?} does not exist")]
    NetworkNotFound(String),

    /// The conditional-write retry budget was exhausted.
    #[error("conflicting writers on network {0:?}, retry budget exhausted")]
    Contention(String),

    /// A stored host set failed to decode.
    #[error("host set for network {0:?} is corrupt: {1}")]
    Codec(String, String),

    /// Errors passed through from the underlying versioned store.
    #[error(transparent)]
    Store(SE),
}

impl<SE, IE> From<MembershipError<SE>> for Error<SE, IE>
where
    SE: StoreError,
    IE: IntentServiceError,
{
    fn from(error: MembershipError<SE>) -> Self {
        match error {
            MembershipError::NetworkNotFound(network) => Self::NetworkNotFound(network),
            MembershipError::Contention(network) => Self::Contention(network),
            MembershipError::Codec(network, detail) => Self::Codec(network, detail),
            MembershipError::Store(error) => Self::Store(error),
        }
    }
}
