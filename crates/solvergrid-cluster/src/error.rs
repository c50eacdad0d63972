//! Error types for cluster communication and coordination.

use thiserror::Error;

use crate::channel::Address;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur on the cluster channel or in the lock service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// No reply within the call timeout. The outcome on the remote side is unknown.
    #[error("call to {target} ({service}) timed out")]
    Timeout { target: Address, service: String },

    /// The target departed from the view while the call was in flight.
    #[error("member {0} suspected or departed")]
    Suspected(Address),

    /// The target (or the caller) is not part of the current view.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("no handler registered for service '{0}'")]
    UnknownService(String),

    #[error("codec error: {0}")]
    Codec(String),

    /// Application-level failure reported by the remote handler.
    #[error("remote error: {0}")]
    Remote(String),

    /// A blocking lock acquisition was interrupted by its caller.
    #[error("interrupted while waiting for lock '{0}'")]
    Interrupted(String),
}

impl ClusterError {
    /// Transport failures the caller may re-query and retry.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ClusterError::Timeout { .. } | ClusterError::Suspected(_) | ClusterError::Unavailable(_)
        )
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Codec(e.to_string())
    }
}
