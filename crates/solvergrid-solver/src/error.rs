//! Solver server error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use solvergrid_cluster::ClusterError;
use solvergrid_core::SolverKind;
use solvergrid_sectioning::SectioningError;
use solvergrid_state::StateError;

pub type SolverResult<T> = Result<T, SolverError>;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("no {kind} solver with key {key}")]
    NotFound { kind: SolverKind, key: String },

    #[error("no node available for a new {0} solver")]
    NoAvailableNode(SolverKind),

    /// Transport failure. The remote outcome is unknown; re-query before retrying.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("solver server is shutting down")]
    ShuttingDown,

    #[error("invalid solver config: {0}")]
    InvalidConfig(String),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("sectioning error: {0}")]
    Sectioning(#[from] SectioningError),

    #[error("sectioning worker failed: {0}")]
    Worker(String),

    #[error("cluster error: {0}")]
    Cluster(ClusterError),

    /// Failure reported by the remote solver server.
    #[error("remote error: {0}")]
    Remote(String),
}

impl SolverError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SolverError::Unavailable(_) | SolverError::ShuttingDown)
    }
}

impl From<ClusterError> for SolverError {
    fn from(e: ClusterError) -> Self {
        if e.is_unavailable() {
            SolverError::Unavailable(e.to_string())
        } else {
            SolverError::Cluster(e)
        }
    }
}

/// A `SolverError` as it crosses the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum WireError {
    NotFound { kind: SolverKind, key: String },
    NoAvailableNode { kind: SolverKind },
    Unavailable { message: String },
    InvalidConfig { message: String },
    Failed { message: String },
}

impl From<&SolverError> for WireError {
    fn from(e: &SolverError) -> Self {
        match e {
            SolverError::NotFound { kind, key } => WireError::NotFound {
                kind: *kind,
                key: key.clone(),
            },
            SolverError::NoAvailableNode(kind) => WireError::NoAvailableNode { kind: *kind },
            SolverError::Unavailable(_) | SolverError::ShuttingDown => WireError::Unavailable {
                message: e.to_string(),
            },
            SolverError::InvalidConfig(message) => WireError::InvalidConfig {
                message: message.clone(),
            },
            other => WireError::Failed {
                message: other.to_string(),
            },
        }
    }
}

impl From<WireError> for SolverError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::NotFound { kind, key } => SolverError::NotFound { kind, key },
            WireError::NoAvailableNode { kind } => SolverError::NoAvailableNode(kind),
            WireError::Unavailable { message } => SolverError::Unavailable(message),
            WireError::InvalidConfig { message } => SolverError::InvalidConfig(message),
            WireError::Failed { message } => SolverError::Remote(message),
        }
    }
}
