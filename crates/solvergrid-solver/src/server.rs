//! The solver server: one per node.
//!
//! Holds one local container per solver kind and answers the `solver`
//! service for the rest of the cluster. Cluster-wide operations (lookup,
//! creation, listing) consult the other members through typed stubs.
//!
//! Creation follows the placement policy: look the key up, take the
//! `create/{kind}/{key}` lock, look it up again, then ask one randomly
//! chosen available member to build it. Losing creators find the winner's
//! instance on the second lookup.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use solvergrid_cluster::channel::{decode, encode};
use solvergrid_cluster::{
    Address, CallMode, ClusterChannel, ClusterError, ClusterResult, CoordinatorRole, ElectionHandle, LeadershipState,
    LockService, RpcHandler, broadcast_typed,
};
use solvergrid_core::config::{NodeConfig, SectioningConfig};
use solvergrid_core::{GridConfig, SolverKey, SolverKind, epoch_secs};
use solvergrid_sectioning::AuditSink;
use solvergrid_state::SessionStore;

use crate::container::{LocalSolverContainer, SolverContainer};
use crate::error::{SolverError, SolverResult, WireError};
use crate::placement::{self, ClusterLoad, NodeInfo};
use crate::protocol::{ContainerCall, Reply, SOLVER_SERVICE, SolverRequest};
use crate::remote::RemoteSolverServer;
use crate::sessions::{
    BatchItem, BatchOutcome, OnlineSectioningFactory, OnlineSectioningSolver, OptimizationFactory, OptimizationSession,
};
use crate::solver::{SolverConfig, SolverInfo};

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub node: NodeConfig,
    pub sectioning: SectioningConfig,
    pub rpc_timeout: Duration,
    /// Seed for placement choices; entropy when unset.
    pub placement_seed: Option<u64>,
}

impl ServerSettings {
    pub fn from_config(config: &GridConfig) -> Self {
        Self {
            node: config.node.clone(),
            sectioning: config.sectioning.clone(),
            rpc_timeout: config.cluster.rpc_timeout(),
            placement_seed: None,
        }
    }
}

/// Per-node solver facade. Cheap to clone.
#[derive(Clone)]
pub struct SolverServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    channel: Arc<dyn ClusterChannel>,
    locks: LockService,
    settings: ServerSettings,
    online: Arc<LocalSolverContainer<OnlineSectioningSolver>>,
    timetabling: Arc<LocalSolverContainer<OptimizationSession>>,
    examination: Arc<LocalSolverContainer<OptimizationSession>>,
    student_sectioning: Arc<LocalSolverContainer<OptimizationSession>>,
    active: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    electors: tokio::sync::Mutex<Vec<ElectionHandle>>,
    master: std::sync::RwLock<Option<watch::Receiver<LeadershipState>>>,
    rng: std::sync::Mutex<StdRng>,
    started_at: u64,
}

/// Counts one request towards the drain on shutdown.
struct InFlight<'a>(&'a ServerInner);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

impl SolverServer {
    /// Build the containers and register the `solver` service on `channel`.
    pub fn start(
        channel: Arc<dyn ClusterChannel>,
        locks: LockService,
        store: Arc<dyn SessionStore>,
        audit: Arc<dyn AuditSink>,
        settings: ServerSettings,
    ) -> SolverResult<Self> {
        let host = channel.local_address().clone();
        let memory = settings.node.solver_memory_bytes;
        let optimization = |kind: SolverKind| -> SolverResult<Arc<LocalSolverContainer<OptimizationSession>>> {
            let factory = OptimizationFactory::new(kind, store.clone(), settings.sectioning.clone())?;
            Ok(Arc::new(LocalSolverContainer::new(kind, host.clone(), memory, Arc::new(factory))))
        };
        let timetabling = optimization(SolverKind::CourseTimetabling)?;
        let examination = optimization(SolverKind::Examination)?;
        let student_sectioning = optimization(SolverKind::StudentSectioning)?;
        let online = Arc::new(LocalSolverContainer::new(
            SolverKind::OnlineSectioning,
            host.clone(),
            memory,
            Arc::new(OnlineSectioningFactory::new(
                store.clone(),
                settings.sectioning.clone(),
                audit,
            )),
        ));

        let rng = match settings.placement_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let inner = Arc::new(ServerInner {
            channel: channel.clone(),
            locks,
            settings,
            online,
            timetabling,
            examination,
            student_sectioning,
            active: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            electors: tokio::sync::Mutex::new(Vec::new()),
            master: std::sync::RwLock::new(None),
            rng: std::sync::Mutex::new(rng),
            started_at: epoch_secs(),
        });
        channel.register(
            SOLVER_SERVICE,
            Arc::new(SolverRpc {
                inner: Arc::downgrade(&inner),
            }),
        );
        info!(node = %host, "solver server started");
        Ok(Self { inner })
    }

    /// Keep an election running for this node; the server stops it on shutdown.
    pub async fn attach_elector(&self, handle: ElectionHandle) {
        if handle.role() == CoordinatorRole::Master {
            *self.inner.master.write().unwrap_or_else(|e| e.into_inner()) = Some(handle.subscribe());
        }
        self.inner.electors.lock().await.push(handle);
    }

    pub fn local_address(&self) -> &Address {
        self.inner.channel.local_address()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Whether this node holds the master role.
    pub fn is_master(&self) -> bool {
        self.inner
            .master
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|rx| rx.borrow().is_leader())
    }

    pub async fn usage(&self) -> u32 {
        let mut total = 0;
        for kind in SolverKind::ALL {
            total += self.local_len(kind).await as u32;
        }
        total
    }

    pub async fn used_memory(&self) -> u64 {
        self.usage().await as u64 * self.inner.settings.node.solver_memory_bytes
    }

    pub async fn free_memory(&self) -> u64 {
        self.inner
            .settings
            .node
            .capacity_memory_bytes
            .saturating_sub(self.used_memory().await)
    }

    pub async fn is_available(&self) -> bool {
        self.is_active() && self.free_memory().await >= self.inner.settings.node.memory_floor_bytes
    }

    pub async fn node_info(&self) -> NodeInfo {
        let mut solvers = std::collections::BTreeMap::new();
        for kind in SolverKind::ALL {
            solvers.insert(kind, self.local_len(kind).await as u32);
        }
        let node = &self.inner.settings.node;
        NodeInfo {
            address: self.local_address().clone(),
            active: self.is_active(),
            capacity_memory_bytes: node.capacity_memory_bytes,
            used_memory_bytes: self.used_memory().await,
            memory_floor_bytes: node.memory_floor_bytes,
            usage: solvers.values().sum(),
            solvers,
            is_master: self.is_master(),
            started_at: self.inner.started_at,
        }
    }

    /// The member currently holding the master role, if any answers.
    pub async fn master_address(&self) -> SolverResult<Option<Address>> {
        if self.is_master() {
            return Ok(Some(self.local_address().clone()));
        }
        let replies: Vec<(Address, SolverResult<bool>)> = self.broadcast(&SolverRequest::IsCoordinator).await?;
        Ok(replies
            .into_iter()
            .find_map(|(address, reply)| matches!(reply, Ok(true)).then_some(address)))
    }

    /// The local container of `kind`.
    pub fn container(&self, kind: SolverKind) -> Arc<dyn SolverContainer> {
        let inner = &self.inner;
        match kind {
            SolverKind::OnlineSectioning => inner.online.clone(),
            SolverKind::CourseTimetabling => inner.timetabling.clone(),
            SolverKind::Examination => inner.examination.clone(),
            SolverKind::StudentSectioning => inner.student_sectioning.clone(),
        }
    }

    /// A local online-sectioning instance.
    pub async fn online_solver(&self, key: &str) -> Option<Arc<OnlineSectioningSolver>> {
        self.inner.online.solver(key).await
    }

    /// Stub for the solver server of another member.
    pub fn remote(&self, address: Address) -> RemoteSolverServer {
        RemoteSolverServer::new(self.inner.channel.clone(), address, self.inner.settings.rpc_timeout)
    }

    // ── Cluster-wide operations ────────────────────────────────────

    /// Node holding the instance: this node first, then the other members.
    /// Members that do not answer are skipped.
    pub async fn find_solver(&self, kind: SolverKind, key: &str) -> SolverResult<Option<Address>> {
        self.locate(kind, key, false).await
    }

    pub async fn get_solver(&self, kind: SolverKind, key: &str) -> SolverResult<Option<SolverInfo>> {
        match self.find_solver(kind, key).await? {
            Some(address) => self.container_at(kind, &address).get_solver(key).await,
            None => Ok(None),
        }
    }

    /// `get_solver` for the creation path: a member that does not answer
    /// fails the lookup, as it may hold the instance.
    async fn get_solver_strict(&self, kind: SolverKind, key: &str) -> SolverResult<Option<SolverInfo>> {
        match self.locate(kind, key, true).await? {
            Some(address) => self.container_at(kind, &address).get_solver(key).await,
            None => Ok(None),
        }
    }

    async fn locate(&self, kind: SolverKind, key: &str, strict: bool) -> SolverResult<Option<Address>> {
        if self.container(kind).has_solver(key).await? {
            return Ok(Some(self.local_address().clone()));
        }
        let local = self.local_address().clone();
        let replies: Vec<(Address, SolverResult<bool>)> = self
            .broadcast(&SolverRequest::Container {
                kind,
                call: ContainerCall::Has { key: key.to_string() },
            })
            .await?;
        let mut found = None;
        for (address, reply) in replies {
            match reply {
                Ok(true) if address != local => {
                    found.get_or_insert(address);
                }
                Ok(_) => {}
                Err(e) if strict => {
                    warn!(node = %address, %kind, %key, error = %e, "member did not answer solver lookup");
                    return Err(SolverError::Unavailable(format!(
                        "cannot tell whether {address} holds {kind} solver {key}: {e}"
                    )));
                }
                Err(e) => debug!(node = %address, error = %e, "lookup skipped member"),
            }
        }
        Ok(found)
    }

    /// Create the instance for `key` somewhere in the cluster, unless one exists.
    pub async fn create_solver(&self, kind: SolverKind, key: &str, config: SolverConfig) -> SolverResult<SolverInfo> {
        let _guard = self.begin()?;
        if let Some(info) = self.get_solver_strict(kind, key).await? {
            return Ok(info);
        }
        // Holding the creation lock must not depend on the caller staying around.
        let server = self.clone();
        let key = key.to_string();
        tokio::spawn(async move { server.create_locked(kind, &key, config).await })
            .await
            .map_err(|e| SolverError::Worker(format!("creation task failed: {e}")))?
    }

    async fn create_locked(&self, kind: SolverKind, key: &str, config: SolverConfig) -> SolverResult<SolverInfo> {
        let lock_name = format!("create/{kind}/{key}");
        self.inner.locks.lock(&lock_name).await?;
        let result = self.place(kind, key, config).await;
        if let Err(e) = self.inner.locks.unlock(&lock_name).await {
            warn!(lock = %lock_name, error = %e, "failed to release creation lock");
        }
        result
    }

    async fn place(&self, kind: SolverKind, key: &str, config: SolverConfig) -> SolverResult<SolverInfo> {
        if let Some(info) = self.get_solver_strict(kind, key).await? {
            debug!(%kind, %key, host = %info.host, "solver created concurrently");
            return Ok(info);
        }
        let replies: Vec<(Address, SolverResult<bool>)> = self.broadcast(&SolverRequest::IsAvailable).await?;
        let candidates = placement::available_members(replies);
        let target = {
            let mut rng = self.inner.rng.lock().unwrap_or_else(|e| e.into_inner());
            placement::choose_node(&candidates, &mut *rng)
        }
        .ok_or(SolverError::NoAvailableNode(kind))?;
        info!(%kind, %key, node = %target, "placing solver");
        self.container_at(kind, &target).create_solver(key, config).await
    }

    pub async fn remove_solver(&self, kind: SolverKind, key: &str) -> SolverResult<bool> {
        match self.find_solver(kind, key).await? {
            Some(address) => self.container_at(kind, &address).remove_solver(key).await,
            None => Ok(false),
        }
    }

    pub async fn refresh_solver(&self, kind: SolverKind, key: &str) -> SolverResult<SolverInfo> {
        let address = self
            .find_solver(kind, key)
            .await?
            .ok_or_else(|| SolverError::NotFound {
                kind,
                key: key.to_string(),
            })?;
        self.container_at(kind, &address).refresh_solver(key).await
    }

    /// Instances of `kind` on every reachable member.
    pub async fn list_solvers(&self, kind: SolverKind) -> SolverResult<Vec<SolverInfo>> {
        let replies: Vec<(Address, SolverResult<Vec<SolverInfo>>)> = self
            .broadcast(&SolverRequest::Container {
                kind,
                call: ContainerCall::List,
            })
            .await?;
        let mut infos = Vec::new();
        for (address, reply) in replies {
            match reply {
                Ok(list) => infos.extend(list),
                Err(e) => warn!(node = %address, error = %e, "member did not list its solvers"),
            }
        }
        infos.sort_by(|a, b| a.key.cmp(&b.key).then(a.host.cmp(&b.host)));
        Ok(infos)
    }

    pub async fn cluster_load(&self) -> SolverResult<ClusterLoad> {
        let replies: Vec<(Address, SolverResult<NodeInfo>)> = self.broadcast(&SolverRequest::NodeInfo).await?;
        let mut nodes = Vec::new();
        let mut unreachable = Vec::new();
        for (address, reply) in replies {
            match reply {
                Ok(info) => nodes.push(info),
                Err(_) => unreachable.push(address),
            }
        }
        Ok(ClusterLoad::aggregate(nodes, unreachable))
    }

    /// Route a sectioning batch to the node hosting session `key`.
    pub async fn section(&self, key: &str, batch: Vec<BatchItem>) -> SolverResult<Vec<BatchOutcome>> {
        let _guard = self.begin()?;
        let address = self
            .find_solver(SolverKind::OnlineSectioning, key)
            .await?
            .ok_or_else(|| SolverError::NotFound {
                kind: SolverKind::OnlineSectioning,
                key: key.to_string(),
            })?;
        if &address == self.local_address() {
            self.section_local(key, batch).await
        } else {
            self.remote(address).sectioning(key).section(batch).await
        }
    }

    /// Unload local instances idle for at least `max_idle`.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<(SolverKind, SolverKey)> {
        let mut evicted = Vec::new();
        for kind in SolverKind::ALL {
            match self.container(kind).evict_idle(max_idle).await {
                Ok(keys) => evicted.extend(keys.into_iter().map(|key| (kind, key))),
                Err(e) => warn!(%kind, error = %e, "idle eviction failed"),
            }
        }
        evicted
    }

    /// Stop accepting work, drain in-flight requests, step down from
    /// coordinator roles and leave the group. Local instances are dropped.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.local_address(), "solver server shutting down");

        let drained = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(drain_timeout, drained).await.is_err() {
            warn!(
                in_flight = self.inner.in_flight.load(Ordering::SeqCst),
                "drain timed out"
            );
        }

        for mut handle in self.inner.electors.lock().await.drain(..) {
            handle.stop().await;
        }
        self.inner.locks.shutdown();

        for kind in SolverKind::ALL {
            let container = self.container(kind);
            if let Ok(keys) = container.solver_keys().await {
                for key in keys {
                    if let Err(e) = container.remove_solver(&key).await {
                        warn!(%kind, %key, error = %e, "failed to drop solver on shutdown");
                    }
                }
            }
        }
        self.inner.channel.leave().await;
        info!(node = %self.local_address(), "solver server stopped");
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn begin(&self) -> SolverResult<InFlight<'_>> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(&self.inner);
        if !self.is_active() {
            return Err(SolverError::ShuttingDown);
        }
        Ok(guard)
    }

    fn container_at(&self, kind: SolverKind, address: &Address) -> Arc<dyn SolverContainer> {
        if address == self.local_address() {
            self.container(kind)
        } else {
            Arc::new(self.remote(address.clone()).container(kind))
        }
    }

    async fn local_len(&self, kind: SolverKind) -> usize {
        let inner = &self.inner;
        match kind {
            SolverKind::OnlineSectioning => inner.online.len().await,
            SolverKind::CourseTimetabling => inner.timetabling.len().await,
            SolverKind::Examination => inner.examination.len().await,
            SolverKind::StudentSectioning => inner.student_sectioning.len().await,
        }
    }

    async fn section_local(&self, key: &str, batch: Vec<BatchItem>) -> SolverResult<Vec<BatchOutcome>> {
        let solver = self.online_solver(key).await.ok_or_else(|| SolverError::NotFound {
            kind: SolverKind::OnlineSectioning,
            key: key.to_string(),
        })?;
        solver.section(batch).await
    }

    /// Ask every member, this node included, and decode each reply.
    async fn broadcast<T: DeserializeOwned>(&self, request: &SolverRequest) -> SolverResult<Vec<(Address, SolverResult<T>)>> {
        let replies: Vec<(Address, ClusterResult<Reply<T>>)> = broadcast_typed(
            self.inner.channel.as_ref(),
            SOLVER_SERVICE,
            request,
            CallMode::AllResponses,
            self.inner.settings.rpc_timeout,
        )
        .await?;
        Ok(replies
            .into_iter()
            .map(|(address, reply)| {
                let reply = match reply {
                    Ok(reply) => reply.map_err(SolverError::from),
                    Err(e) => Err(SolverError::from(e)),
                };
                (address, reply)
            })
            .collect())
    }

    // ── Serving the `solver` service ───────────────────────────────

    async fn serve(&self, request: SolverRequest) -> ClusterResult<Vec<u8>> {
        match request {
            SolverRequest::IsAvailable => reply(Ok(self.is_available().await)),
            SolverRequest::IsCoordinator => reply(Ok(self.is_master())),
            SolverRequest::NodeInfo => reply(Ok(self.node_info().await)),
            SolverRequest::Section { key, batch } => {
                let result = match self.begin() {
                    Ok(_guard) => self.section_local(&key, batch).await,
                    Err(e) => Err(e),
                };
                reply(result)
            }
            SolverRequest::Container { kind, call } => self.serve_container(kind, call).await,
        }
    }

    async fn serve_container(&self, kind: SolverKind, call: ContainerCall) -> ClusterResult<Vec<u8>> {
        let container = self.container(kind);
        match call {
            ContainerCall::Create { key, config } => {
                let result = match self.begin() {
                    Ok(_guard) => container.create_solver(&key, config).await,
                    Err(e) => Err(e),
                };
                reply(result)
            }
            ContainerCall::Get { key } => reply(container.get_solver(&key).await),
            ContainerCall::Has { key } => reply(container.has_solver(&key).await),
            ContainerCall::Remove { key } => reply(container.remove_solver(&key).await),
            ContainerCall::Keys => reply(container.solver_keys().await),
            ContainerCall::List => reply(container.list_solvers().await),
            ContainerCall::Usage => reply(container.usage().await),
            ContainerCall::Refresh { key } => reply(container.refresh_solver(&key).await),
            ContainerCall::EvictIdle { max_idle_secs } => {
                reply(container.evict_idle(Duration::from_secs(max_idle_secs)).await)
            }
        }
    }
}

fn reply<T: Serialize>(result: SolverResult<T>) -> ClusterResult<Vec<u8>> {
    let wire: Reply<T> = result.map_err(|e| WireError::from(&e));
    encode(&wire)
}

struct SolverRpc {
    inner: Weak<ServerInner>,
}

#[async_trait]
impl RpcHandler for SolverRpc {
    async fn handle(&self, from: Address, payload: Vec<u8>) -> ClusterResult<Vec<u8>> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| ClusterError::Unavailable("solver server stopped".to_string()))?;
        let request: SolverRequest = decode(&payload)?;
        debug!(%from, ?request, "solver request");
        SolverServer { inner }.serve(request).await
    }
}
