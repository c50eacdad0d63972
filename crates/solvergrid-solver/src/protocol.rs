//! Messages of the `solver` service.
//!
//! Each remote operation is one variant of `SolverRequest`. Replies are
//! `Reply<T>` where `T` depends on the variant; the stubs in `remote` know
//! which.

use serde::{Deserialize, Serialize};

use solvergrid_core::{SolverKey, SolverKind};

use crate::error::WireError;
use crate::sessions::BatchItem;
use crate::solver::SolverConfig;

pub const SOLVER_SERVICE: &str = "solver";

pub type Reply<T> = Result<T, WireError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SolverRequest {
    /// `Reply<bool>`
    IsAvailable,
    /// `Reply<bool>`
    IsCoordinator,
    /// `Reply<NodeInfo>`
    NodeInfo,
    Container { kind: SolverKind, call: ContainerCall },
    /// `Reply<Vec<BatchOutcome>>`
    Section { key: SolverKey, batch: Vec<BatchItem> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum ContainerCall {
    /// `Reply<SolverInfo>`
    Create { key: SolverKey, config: SolverConfig },
    /// `Reply<Option<SolverInfo>>`
    Get { key: SolverKey },
    /// `Reply<bool>`
    Has { key: SolverKey },
    /// `Reply<bool>`
    Remove { key: SolverKey },
    /// `Reply<Vec<SolverKey>>`
    Keys,
    /// `Reply<Vec<SolverInfo>>`
    List,
    /// `Reply<u32>`
    Usage,
    /// `Reply<SolverInfo>`
    Refresh { key: SolverKey },
    /// `Reply<Vec<SolverKey>>`
    EvictIdle { max_idle_secs: u64 },
}
