//! Typed client stubs for a solver server on another node.
//!
//! Every method sends one `SolverRequest` with a bounded timeout. Transport
//! failures come back as `SolverError::Unavailable`; nothing is retried here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use solvergrid_cluster::{Address, ClusterChannel, call_typed};
use solvergrid_core::{SolverKey, SolverKind};

use crate::container::SolverContainer;
use crate::error::{SolverError, SolverResult};
use crate::placement::NodeInfo;
use crate::protocol::{ContainerCall, Reply, SOLVER_SERVICE, SolverRequest};
use crate::sessions::{BatchItem, BatchOutcome};
use crate::solver::{SolverConfig, SolverInfo};

async fn invoke<T: DeserializeOwned>(
    channel: &dyn ClusterChannel,
    target: &Address,
    request: &SolverRequest,
    timeout: Duration,
) -> SolverResult<T> {
    let reply: Reply<T> = call_typed(channel, target, SOLVER_SERVICE, request, timeout).await?;
    reply.map_err(SolverError::from)
}

/// The solver server of `target`.
#[derive(Clone)]
pub struct RemoteSolverServer {
    channel: Arc<dyn ClusterChannel>,
    target: Address,
    timeout: Duration,
}

impl RemoteSolverServer {
    pub fn new(channel: Arc<dyn ClusterChannel>, target: Address, timeout: Duration) -> Self {
        Self {
            channel,
            target,
            timeout,
        }
    }

    pub fn address(&self) -> &Address {
        &self.target
    }

    pub async fn is_available(&self) -> SolverResult<bool> {
        self.send(&SolverRequest::IsAvailable).await
    }

    pub async fn is_coordinator(&self) -> SolverResult<bool> {
        self.send(&SolverRequest::IsCoordinator).await
    }

    pub async fn node_info(&self) -> SolverResult<NodeInfo> {
        self.send(&SolverRequest::NodeInfo).await
    }

    pub fn container(&self, kind: SolverKind) -> RemoteSolverContainer {
        RemoteSolverContainer {
            server: self.clone(),
            kind,
        }
    }

    pub fn sectioning(&self, key: impl Into<SolverKey>) -> RemoteSectioningClient {
        RemoteSectioningClient {
            server: self.clone(),
            key: key.into(),
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: &SolverRequest) -> SolverResult<T> {
        invoke(self.channel.as_ref(), &self.target, request, self.timeout).await
    }
}

/// One container of a remote solver server.
pub struct RemoteSolverContainer {
    server: RemoteSolverServer,
    kind: SolverKind,
}

impl RemoteSolverContainer {
    async fn send<T: DeserializeOwned>(&self, call: ContainerCall) -> SolverResult<T> {
        self.server
            .send(&SolverRequest::Container { kind: self.kind, call })
            .await
    }
}

#[async_trait]
impl SolverContainer for RemoteSolverContainer {
    fn kind(&self) -> SolverKind {
        self.kind
    }

    async fn create_solver(&self, key: &str, config: SolverConfig) -> SolverResult<SolverInfo> {
        self.send(ContainerCall::Create {
            key: key.to_string(),
            config,
        })
        .await
    }

    async fn get_solver(&self, key: &str) -> SolverResult<Option<SolverInfo>> {
        self.send(ContainerCall::Get { key: key.to_string() }).await
    }

    async fn has_solver(&self, key: &str) -> SolverResult<bool> {
        self.send(ContainerCall::Has { key: key.to_string() }).await
    }

    async fn remove_solver(&self, key: &str) -> SolverResult<bool> {
        self.send(ContainerCall::Remove { key: key.to_string() }).await
    }

    async fn solver_keys(&self) -> SolverResult<Vec<SolverKey>> {
        self.send(ContainerCall::Keys).await
    }

    async fn list_solvers(&self) -> SolverResult<Vec<SolverInfo>> {
        self.send(ContainerCall::List).await
    }

    async fn usage(&self) -> SolverResult<u32> {
        self.send(ContainerCall::Usage).await
    }

    async fn refresh_solver(&self, key: &str) -> SolverResult<SolverInfo> {
        self.send(ContainerCall::Refresh { key: key.to_string() }).await
    }

    async fn evict_idle(&self, max_idle: Duration) -> SolverResult<Vec<SolverKey>> {
        self.send(ContainerCall::EvictIdle {
            max_idle_secs: max_idle.as_secs(),
        })
        .await
    }
}

/// An online-sectioning solver hosted on another node.
pub struct RemoteSectioningClient {
    server: RemoteSolverServer,
    key: SolverKey,
}

impl RemoteSectioningClient {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn section(&self, batch: Vec<BatchItem>) -> SolverResult<Vec<BatchOutcome>> {
        self.server
            .send(&SolverRequest::Section {
                key: self.key.clone(),
                batch,
            })
            .await
    }
}
