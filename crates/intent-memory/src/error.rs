use netmesh_intent::IntentServiceError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
#[error("Intent service error")]
pub struct Error;

impl IntentServiceError for Error {}
