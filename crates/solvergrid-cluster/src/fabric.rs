//! In-process group fabric.
//!
//! Every node of a simulated cluster joins the same `InProcessFabric` and
//! gets a `FabricEndpoint`. Calls are dispatched to the target's registered
//! handler on its own task, with the payload passed as bytes exactly as a
//! network transport would. Views are published through one shared `watch`
//! channel.
//!
//! Failure simulation: `FabricEndpoint::crash` makes a member stop answering
//! and stop heartbeating without leaving. The failure detector then
//! suspects it and removes it from the view, which fails its in-flight
//! calls as `Suspected`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::channel::{Address, CallMode, ClusterChannel, RpcHandler, View};
use crate::error::{ClusterError, ClusterResult};
use crate::membership::MembershipManager;

/// A named group shared by in-process endpoints.
#[derive(Clone)]
pub struct InProcessFabric {
    inner: Arc<FabricInner>,
}

struct FabricInner {
    group: String,
    state: Mutex<FabricState>,
    view_tx: watch::Sender<View>,
}

struct FabricState {
    membership: MembershipManager,
    endpoints: HashMap<Address, Arc<EndpointCore>>,
}

struct EndpointCore {
    address: Address,
    handlers: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
    departed: watch::Sender<bool>,
    silent: AtomicBool,
}

impl EndpointCore {
    fn handler(&self, service: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .cloned()
    }
}

impl InProcessFabric {
    pub fn new(group: impl Into<String>) -> Self {
        Self::with_suspect_timeout(group, Duration::from_secs(10))
    }

    pub fn with_suspect_timeout(group: impl Into<String>, suspect_timeout: Duration) -> Self {
        let (view_tx, _) = watch::channel(View::default());
        Self {
            inner: Arc::new(FabricInner {
                group: group.into(),
                state: Mutex::new(FabricState {
                    membership: MembershipManager::new().with_suspect_timeout(suspect_timeout),
                    endpoints: HashMap::new(),
                }),
                view_tx,
            }),
        }
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// Join the group under `name`. The new member is appended to the view.
    pub fn join(&self, name: impl Into<String>) -> ClusterResult<Arc<FabricEndpoint>> {
        let address = Address::new(name);
        let (departed, _) = watch::channel(false);
        let core = Arc::new(EndpointCore {
            address: address.clone(),
            handlers: RwLock::new(HashMap::new()),
            departed,
            silent: AtomicBool::new(false),
        });

        let view = {
            let mut state = self.lock_state();
            if state.endpoints.contains_key(&address) {
                return Err(ClusterError::Unavailable(format!("address {address} already in use")));
            }
            state.endpoints.insert(address.clone(), core.clone());
            state.membership.join(address.clone())
        };
        info!(group = %self.inner.group, %address, view = view.id, "joined group");
        self.inner.view_tx.send_replace(view);

        Ok(Arc::new(FabricEndpoint {
            fabric: self.clone(),
            core,
        }))
    }

    pub fn view(&self) -> View {
        self.inner.view_tx.borrow().clone()
    }

    /// Record a heartbeat from a member.
    pub fn heartbeat(&self, address: &Address) -> bool {
        self.lock_state().membership.heartbeat(address)
    }

    /// Remove every member that missed its heartbeats.
    pub fn reap_suspects(&self) -> Vec<Address> {
        let (reaped, cores, view) = {
            let mut state = self.lock_state();
            let (reaped, view) = state.membership.reap_suspects();
            let cores: Vec<Arc<EndpointCore>> = reaped
                .iter()
                .filter_map(|address| state.endpoints.remove(address))
                .collect();
            (reaped, cores, view)
        };
        if let Some(view) = view {
            self.inner.view_tx.send_replace(view);
        }
        for core in cores {
            core.departed.send_replace(true);
        }
        reaped
    }

    /// Periodically reap suspected members until shutdown.
    pub fn spawn_failure_detector(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let fabric = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = fabric.reap_suspects();
                        if !reaped.is_empty() {
                            warn!(group = %fabric.inner.group, ?reaped, "suspected members removed from view");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("failure detector shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn remove(&self, address: &Address) {
        let (core, view) = {
            let mut state = self.lock_state();
            let view = state.membership.leave(address);
            (state.endpoints.remove(address), view)
        };
        if let Some(view) = view {
            self.inner.view_tx.send_replace(view);
        }
        if let Some(core) = core {
            core.departed.send_replace(true);
        }
    }

    fn resolve(&self, address: &Address) -> Option<Arc<EndpointCore>> {
        self.lock_state().endpoints.get(address).cloned()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FabricState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One node's endpoint in an `InProcessFabric`.
pub struct FabricEndpoint {
    fabric: InProcessFabric,
    core: Arc<EndpointCore>,
}

impl FabricEndpoint {
    pub fn fabric(&self) -> &InProcessFabric {
        &self.fabric
    }

    /// Stop answering calls and heartbeats without leaving the group.
    pub fn crash(&self) {
        warn!(address = %self.core.address, "endpoint crashed");
        self.core.silent.store(true, Ordering::SeqCst);
    }

    pub fn is_crashed(&self) -> bool {
        self.core.silent.load(Ordering::SeqCst)
    }

    /// Send heartbeats to the fabric until shutdown, crash or departure.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let endpoint = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if endpoint.is_crashed() || !endpoint.fabric.heartbeat(&endpoint.core.address) {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!(address = %endpoint.core.address, "heartbeat loop stopped");
        })
    }

    fn ensure_member(&self) -> ClusterResult<()> {
        if self.fabric.resolve(&self.core.address).is_none() {
            return Err(ClusterError::Unavailable(format!(
                "{} is not a member of {}",
                self.core.address, self.fabric.inner.group
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterChannel for FabricEndpoint {
    fn local_address(&self) -> &Address {
        &self.core.address
    }

    fn view(&self) -> View {
        self.fabric.view()
    }

    fn subscribe_view(&self) -> watch::Receiver<View> {
        self.fabric.inner.view_tx.subscribe()
    }

    fn register(&self, service: &str, handler: Arc<dyn RpcHandler>) {
        self.core
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service.to_string(), handler);
        debug!(address = %self.core.address, %service, "service registered");
    }

    async fn call(
        &self,
        target: &Address,
        service: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> ClusterResult<Vec<u8>> {
        self.ensure_member()?;
        let core = self
            .fabric
            .resolve(target)
            .ok_or_else(|| ClusterError::Unavailable(format!("{target} is not a member")))?;
        invoke(self.core.address.clone(), core, service.to_string(), payload, timeout).await
    }

    async fn broadcast(
        &self,
        service: &str,
        payload: Vec<u8>,
        mode: CallMode,
        timeout: Duration,
    ) -> Vec<(Address, ClusterResult<Vec<u8>>)> {
        if let Err(e) = self.ensure_member() {
            return vec![(self.core.address.clone(), Err(e))];
        }
        let members = self.view().members;
        let mut calls = JoinSet::new();
        for member in &members {
            let Some(core) = self.fabric.resolve(member) else {
                continue;
            };
            let from = self.core.address.clone();
            let service = service.to_string();
            let payload = payload.clone();
            let member = member.clone();
            calls.spawn(async move { (member, invoke(from, core, service, payload, timeout).await) });
        }

        let mut replies = Vec::with_capacity(members.len());
        while let Some(joined) = calls.join_next().await {
            let Ok((member, reply)) = joined else {
                continue;
            };
            if mode == CallMode::FirstResponse && reply.is_ok() {
                calls.detach_all();
                return vec![(member, reply)];
            }
            replies.push((member, reply));
        }
        replies.sort_by_key(|(member, _)| members.iter().position(|m| m == member));
        replies
    }

    async fn leave(&self) {
        info!(group = %self.fabric.inner.group, address = %self.core.address, "leaving group");
        self.fabric.remove(&self.core.address);
    }
}

/// Run one request on the target's handler, failing with `Suspected` if the
/// target departs before answering.
async fn invoke(
    from: Address,
    target: Arc<EndpointCore>,
    service: String,
    payload: Vec<u8>,
    timeout: Duration,
) -> ClusterResult<Vec<u8>> {
    let departed = target.departed.subscribe();
    if target.silent.load(Ordering::SeqCst) {
        return tokio::select! {
            _ = tokio::time::sleep(timeout) => Err(ClusterError::Timeout {
                target: target.address.clone(),
                service,
            }),
            _ = wait_departed(departed) => Err(ClusterError::Suspected(target.address.clone())),
        };
    }

    let handler = target
        .handler(&service)
        .ok_or_else(|| ClusterError::UnknownService(service.clone()))?;
    let mut task = tokio::spawn(async move { handler.handle(from, payload).await });

    tokio::select! {
        joined = &mut task => match joined {
            Ok(reply) => reply,
            Err(e) => Err(ClusterError::Remote(format!("handler failed: {e}"))),
        },
        _ = tokio::time::sleep(timeout) => Err(ClusterError::Timeout {
            target: target.address.clone(),
            service,
        }),
        _ = wait_departed(departed) => {
            task.abort();
            Err(ClusterError::Suspected(target.address.clone()))
        }
    }
}

async fn wait_departed(mut departed: watch::Receiver<bool>) {
    loop {
        if *departed.borrow_and_update() {
            return;
        }
        if departed.changed().await.is_err() {
            return;
        }
    }
}
