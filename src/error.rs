//! Error taxonomy of the orchestrator.
//!
//! Every failure surfaced to a management API caller maps to one of these
//! variants. Internal helpers use `anyhow` with context and are converted
//! at the orchestrator boundary.

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid function package: {0}")]
    PackageInvalid(String),

    #[error("failed to fetch package from {url}: {source}")]
    RemoteFetchFailed {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("image build failed: {0}")]
    BuildFailed(String),

    #[error("failed to create network {name}: {source}")]
    NetworkCreateFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to start replicas: {0}")]
    ReplicaStartFailed(String),

    #[error("ingress registration failed: {0}")]
    IngressRegistrationFailed(String),

    #[error("function {0} not found")]
    NotFound(String),

    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
