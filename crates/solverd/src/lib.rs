//! solverd — assembles a SolverGrid cluster inside one process.
//!
//! Every node gets its own endpoint on a shared `InProcessFabric`:
//!
//! ```text
//! LocalCluster
//!   ├── failure detector (reaps members that miss heartbeats)
//!   └── ClusterNode × N
//!       ├── FabricEndpoint + heartbeat loop
//!       ├── LockService
//!       ├── LeaderElector (master, updater)
//!       ├── SolverServer
//!       └── Coordinator loop
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use solvergrid_cluster::{
    ClusterChannel, CoordinatorRole, FabricEndpoint, InProcessFabric, LeaderElector, LeadershipState, LockService,
};
use solvergrid_core::GridConfig;
use solvergrid_sectioning::{AuditSink, TracingAuditSink};
use solvergrid_solver::{Coordinator, ServerSettings, SolverServer};
use solvergrid_state::StateStore;

/// How long a stopping node waits for in-flight requests.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One member of the local cluster.
pub struct ClusterNode {
    pub endpoint: Arc<FabricEndpoint>,
    pub server: SolverServer,
    pub master: watch::Receiver<LeadershipState>,
    pub updater: watch::Receiver<LeadershipState>,
}

pub struct LocalCluster {
    fabric: InProcessFabric,
    nodes: Vec<ClusterNode>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    /// Start `config.cluster.nodes` nodes sharing `store`.
    pub async fn start(config: &GridConfig, store: StateStore) -> anyhow::Result<Self> {
        Self::start_with_audit(config, store, Arc::new(TracingAuditSink)).await
    }

    pub async fn start_with_audit(
        config: &GridConfig,
        store: StateStore,
        audit: Arc<dyn AuditSink>,
    ) -> anyhow::Result<Self> {
        let cluster = &config.cluster;
        if cluster.nodes == 0 {
            anyhow::bail!("cluster.nodes must be at least 1");
        }

        let fabric = InProcessFabric::with_suspect_timeout(cluster.group.clone(), cluster.suspect_timeout());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut nodes = Vec::with_capacity(cluster.nodes as usize);
        let mut tasks = Vec::new();

        for i in 0..cluster.nodes {
            let endpoint = fabric.join(format!("{}-{i}", config.node.name_prefix))?;
            tasks.push(endpoint.spawn_heartbeat(cluster.heartbeat_interval(), shutdown_rx.clone()));

            let locks = LockService::start(endpoint.clone(), cluster.rpc_timeout());
            let server = SolverServer::start(
                endpoint.clone(),
                locks.clone(),
                Arc::new(store.clone()),
                audit.clone(),
                ServerSettings::from_config(config),
            )?;

            let retry = cluster.lock_retry_delay();
            let master =
                LeaderElector::new(CoordinatorRole::Master, locks.clone(), retry).start(endpoint.subscribe_view());
            let updater = LeaderElector::new(CoordinatorRole::Updater, locks, retry).start(endpoint.subscribe_view());
            let master_rx = master.subscribe();
            let updater_rx = updater.subscribe();
            server.attach_elector(master).await;
            server.attach_elector(updater).await;

            let coordinator = Coordinator::new(server.clone(), Arc::new(store.clone()), config.coordinator.clone())
                .with_updater(updater_rx.clone());
            tasks.push(tokio::spawn(coordinator.run(shutdown_rx.clone())));

            nodes.push(ClusterNode {
                endpoint,
                server,
                master: master_rx,
                updater: updater_rx,
            });
        }

        tasks.push(fabric.spawn_failure_detector(cluster.heartbeat_interval(), shutdown_rx));
        info!(group = %fabric.group(), nodes = nodes.len(), "local cluster started");

        Ok(Self {
            fabric,
            nodes,
            shutdown,
            tasks,
        })
    }

    pub fn fabric(&self) -> &InProcessFabric {
        &self.fabric
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    /// The node that serves the REST API.
    pub fn entry(&self) -> &ClusterNode {
        &self.nodes[0]
    }

    /// Stop the background loops, then every solver server.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for node in &self.nodes {
            node.server.shutdown(DRAIN_TIMEOUT).await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
        info!(group = %self.fabric.group(), "local cluster stopped");
    }
}
