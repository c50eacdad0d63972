//! Long-lived solver instances as containers see them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use solvergrid_cluster::Address;
use solvergrid_core::{SessionId, SolverKey, SolverKind};

use crate::error::SolverResult;

/// Parameters a solver is created with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Session to load. Defaults to the solver key.
    pub session_id: Option<SessionId>,
    pub properties: BTreeMap<String, String>,
}

impl SolverConfig {
    pub fn for_session(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            properties: BTreeMap::new(),
        }
    }

    pub fn session_or<'a>(&'a self, key: &'a str) -> &'a str {
        self.session_id.as_deref().unwrap_or(key)
    }
}

/// What a container reports about one of its instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverInfo {
    pub kind: SolverKind,
    pub key: SolverKey,
    /// Node hosting the instance.
    pub host: Address,
    pub created_at: u64,
    /// Last (re)load of the instance's problem data.
    pub loaded_at: u64,
    pub last_used: u64,
    pub memory_bytes: u64,
    pub summary: BTreeMap<String, String>,
}

/// A solver instance owned by a `LocalSolverContainer`.
#[async_trait]
pub trait ManagedSolver: Send + Sync + 'static {
    fn kind(&self) -> SolverKind;

    fn key(&self) -> &str;

    fn loaded_at(&self) -> u64;

    fn summary(&self) -> BTreeMap<String, String>;

    /// Reload problem data from the store.
    async fn refresh(&self) -> SolverResult<()>;

    /// Called once when the instance leaves its container.
    async fn dispose(&self) {}
}

/// Builds instances for one container.
#[async_trait]
pub trait SolverFactory<S>: Send + Sync {
    async fn create(&self, key: &str, config: &SolverConfig) -> SolverResult<S>;
}
