//! Error types for the NFS provisioner

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while provisioning or deleting NFS-backed volumes
#[derive(Error, Debug)]
pub enum Error {
    /// The claim asks for something this provisioner cannot do
    #[error("unsupported claim: {0}")]
    Unsupported(String),

    /// No valid NFS server address could be resolved for provisioned volumes
    #[error("NFS server lookup failed: {0}")]
    ServerLookup(String),

    /// Creating, chowning or removing the backing directory failed
    #[error("filesystem operation failed for {path}: {reason}")]
    Filesystem { path: String, reason: String },

    /// Export configuration mutation or control-channel call failed
    #[error("export backend error: {0}")]
    Backend(String),

    /// Cluster-API create/delete failed
    #[error("cluster write error: {0}")]
    ClusterWrite(#[source] kube::Error),

    /// Kubernetes API error outside the create/delete path
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a filesystem error on the given path.
    pub fn fs(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Filesystem {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
