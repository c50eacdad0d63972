//! Cluster-wide named locks.
//!
//! Central-lock protocol: the coordinator of the current view owns the lock
//! table (holder plus FIFO queue per name) and every node talks to it over
//! the `lock` service. Grants for queued requests are pushed back to the
//! waiter with a `Grant` message; a waiter that is no longer interested
//! declines and the coordinator moves on to the next one.
//!
//! Fail-over: when the coordinator changes, the new one first asks every
//! member for the locks it holds and the requests it is waiting on, and only
//! serves requests once the table is rebuilt. Locks held by members that
//! departed from the view are released and granted to the next waiter.
//!
//! Locks are owned per node. Local callers contending for the same name are
//! serialised on a node-local gate before talking to the coordinator.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Address, CallMode, ClusterChannel, RpcHandler, View, broadcast_typed, call_typed, decode, encode};
use crate::error::{ClusterError, ClusterResult};

/// Name of the lock service on the channel.
pub const LOCK_SERVICE: &str = "lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LockMessage {
    /// Served by the coordinator's lock table.
    Table(TableRequest),
    /// Sent by the coordinator to a member.
    Member(MemberRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TableRequest {
    Acquire { name: String, request: u64, wait: bool },
    Release { name: String },
    Cancel { name: String, request: u64 },
    Holder { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum MemberRequest {
    Grant { name: String, request: u64 },
    Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LockReply {
    Granted,
    Queued,
    Busy { holder: Address },
    Released { released: bool },
    Cancelled,
    Holder { holder: Option<Address> },
    GrantAck { accepted: bool },
    Snapshot { held: Vec<(String, u64)>, pending: Vec<(String, u64)> },
}

/// A request identified by its node and a per-node sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Owner {
    address: Address,
    request: u64,
}

#[derive(Debug, Default)]
struct LockEntry {
    holder: Option<Owner>,
    queue: VecDeque<Owner>,
}

/// Coordinator-side table.
#[derive(Default)]
struct LockTable {
    /// Rebuilt from member snapshots for the current coordinatorship.
    authoritative: bool,
    entries: HashMap<String, LockEntry>,
}

impl LockTable {
    /// Hand the lock to the next queued owner if it is free.
    fn grant_next(&mut self, name: &str) -> Option<Owner> {
        let entry = self.entries.get_mut(name)?;
        if entry.holder.is_some() {
            return None;
        }
        let next = entry.queue.pop_front();
        if next.is_none() {
            self.entries.remove(name);
            return None;
        }
        entry.holder = next.clone();
        next
    }

    fn release_if(&mut self, name: &str, owner: &Owner) -> Option<Owner> {
        let entry = self.entries.get_mut(name)?;
        if entry.holder.as_ref() != Some(owner) {
            return None;
        }
        entry.holder = None;
        self.grant_next(name)
    }

    /// Drop every holder and waiter not in `view`; returns new grants.
    fn purge(&mut self, view: &View) -> Vec<(String, Owner)> {
        let names: Vec<String> = self.entries.keys().cloned().collect();
        let mut grants = Vec::new();
        for name in names {
            let Some(entry) = self.entries.get_mut(&name) else {
                continue;
            };
            entry.queue.retain(|o| view.contains(&o.address));
            if entry
                .holder
                .as_ref()
                .is_some_and(|h| !view.contains(&h.address))
            {
                if let Some(h) = entry.holder.take() {
                    info!(lock = %name, holder = %h.address, "released lock of departed member");
                }
            }
            if let Some(owner) = self.grant_next(&name) {
                grants.push((name, owner));
            }
        }
        grants
    }
}

/// Client-side state of one node.
#[derive(Default)]
struct ClientState {
    next_request: u64,
    /// Locks this node holds, with the request that won them.
    held: HashMap<String, u64>,
    waiting: HashMap<String, Waiter>,
    /// Node-local gate guards for held locks.
    permits: HashMap<String, OwnedMutexGuard<()>>,
}

struct Waiter {
    request: u64,
    grant_tx: oneshot::Sender<()>,
}

/// Named cluster locks for one node.
#[derive(Clone)]
pub struct LockService {
    inner: Arc<LockInner>,
}

struct LockInner {
    channel: Arc<dyn ClusterChannel>,
    rpc_timeout: Duration,
    client: Mutex<ClientState>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    table: Mutex<LockTable>,
    ready_tx: watch::Sender<bool>,
    view_task: Mutex<Option<JoinHandle<()>>>,
}

impl LockService {
    /// Register the lock service on `channel` and start following views.
    pub fn start(channel: Arc<dyn ClusterChannel>, rpc_timeout: Duration) -> Self {
        let (ready_tx, _) = watch::channel(false);
        let inner = Arc::new(LockInner {
            channel: channel.clone(),
            rpc_timeout,
            client: Mutex::new(ClientState::default()),
            gates: Mutex::new(HashMap::new()),
            table: Mutex::new(LockTable::default()),
            ready_tx,
            view_task: Mutex::new(None),
        });
        channel.register(
            LOCK_SERVICE,
            Arc::new(LockRpc {
                inner: Arc::downgrade(&inner),
            }),
        );

        let follower = inner.clone();
        let task = tokio::spawn(async move { follower.follow_views().await });
        *inner.view_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Self { inner }
    }

    pub fn local_address(&self) -> &Address {
        self.inner.channel.local_address()
    }

    /// Block until this node holds `name`.
    pub async fn lock(&self, name: &str) -> ClusterResult<()> {
        self.inner.acquire(name, None).await
    }

    /// Block until this node holds `name` or `interrupt` becomes true.
    pub async fn lock_interruptibly(&self, name: &str, interrupt: watch::Receiver<bool>) -> ClusterResult<()> {
        self.inner.acquire(name, Some(interrupt)).await
    }

    /// Acquire `name` only if it is free right now.
    pub async fn try_lock(&self, name: &str) -> ClusterResult<bool> {
        self.inner.try_acquire(name).await
    }

    /// Release `name`. Returns false if this node did not hold it.
    pub async fn unlock(&self, name: &str) -> ClusterResult<bool> {
        self.inner.release(name).await
    }

    /// Current holder according to the coordinator.
    pub async fn holder(&self, name: &str) -> ClusterResult<Option<Address>> {
        match self.inner.request(TableRequest::Holder { name: name.to_string() }).await? {
            LockReply::Holder { holder } => Ok(holder),
            other => Err(unexpected(&other)),
        }
    }

    /// Whether this node believes it holds `name`.
    pub fn is_held(&self, name: &str) -> bool {
        self.inner.client().held.contains_key(name)
    }

    /// Stop following views. Held locks are released when the node leaves.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .inner
            .view_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl LockInner {
    fn client(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.client.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn table(&self) -> std::sync::MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn local(&self) -> &Address {
        self.channel.local_address()
    }

    fn gate(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn drop_gate_if_idle(&self, name: &str) {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        if gates.get(name).is_some_and(|g| Arc::strong_count(g) == 1) {
            gates.remove(name);
        }
    }

    async fn request(&self, request: TableRequest) -> ClusterResult<LockReply> {
        let view = self.channel.view();
        let coordinator = view
            .coordinator()
            .cloned()
            .ok_or_else(|| ClusterError::Unavailable("empty view".to_string()))?;
        let message = LockMessage::Table(request);
        call_typed(self.channel.as_ref(), &coordinator, LOCK_SERVICE, &message, self.rpc_timeout).await
    }

    // ── Client side ────────────────────────────────────────────────

    async fn acquire(&self, name: &str, interrupt: Option<watch::Receiver<bool>>) -> ClusterResult<()> {
        let gate = self.gate(name);
        let permit = tokio::select! {
            permit = gate.lock_owned() => permit,
            _ = interrupted(interrupt.clone()) => {
                return Err(ClusterError::Interrupted(name.to_string()));
            }
        };

        let (grant_tx, grant_rx) = oneshot::channel();
        let request = {
            let mut client = self.client();
            client.next_request += 1;
            let request = client.next_request;
            client
                .waiting
                .insert(name.to_string(), Waiter { request, grant_tx });
            request
        };

        let acquire = TableRequest::Acquire {
            name: name.to_string(),
            request,
            wait: true,
        };
        let reply = match self.request(acquire).await {
            Ok(reply) => reply,
            Err(e) => {
                self.abandon(name, request);
                warn!(lock = %name, error = %e, "lock request failed");
                return Err(e);
            }
        };

        match reply {
            LockReply::Granted => {
                let mut client = self.client();
                client.waiting.remove(name);
                client.held.insert(name.to_string(), request);
                client.permits.insert(name.to_string(), permit);
                debug!(lock = %name, "lock granted");
                return Ok(());
            }
            LockReply::Queued => debug!(lock = %name, "lock queued"),
            other => {
                self.abandon(name, request);
                return Err(unexpected(&other));
            }
        }

        let mut views = self.channel.subscribe_view();
        let local = self.local().clone();
        tokio::select! {
            granted = grant_rx => {
                if granted.is_ok() {
                    self.client().permits.insert(name.to_string(), permit);
                    debug!(lock = %name, "queued lock granted");
                    return Ok(());
                }
                Err(ClusterError::Unavailable(format!("lock '{name}' request dropped")))
            }
            _ = interrupted(interrupt) => {
                self.give_up(name, request).await;
                Err(ClusterError::Interrupted(name.to_string()))
            }
            _ = left_view(&mut views, &local) => {
                self.client().waiting.remove(name);
                Err(ClusterError::Unavailable(format!("{local} left the view")))
            }
        }
    }

    async fn try_acquire(&self, name: &str) -> ClusterResult<bool> {
        let Ok(permit) = self.gate(name).try_lock_owned() else {
            return Ok(false);
        };
        let request = {
            let mut client = self.client();
            client.next_request += 1;
            client.next_request
        };
        let acquire = TableRequest::Acquire {
            name: name.to_string(),
            request,
            wait: false,
        };
        match self.request(acquire).await? {
            LockReply::Granted => {
                let mut client = self.client();
                client.held.insert(name.to_string(), request);
                client.permits.insert(name.to_string(), permit);
                Ok(true)
            }
            LockReply::Busy { holder } => {
                debug!(lock = %name, %holder, "lock busy");
                Ok(false)
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn release(&self, name: &str) -> ClusterResult<bool> {
        let permit = {
            let mut client = self.client();
            if client.held.remove(name).is_none() {
                return Ok(false);
            }
            client.permits.remove(name)
        };
        let reply = self.request(TableRequest::Release { name: name.to_string() }).await;
        drop(permit);
        self.drop_gate_if_idle(name);
        match reply? {
            LockReply::Released { released } => {
                if !released {
                    warn!(lock = %name, "coordinator did not record this node as holder");
                }
                debug!(lock = %name, "lock released");
                Ok(true)
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Withdraw a request whose outcome is unknown: the coordinator removes
    /// it from the queue, or releases the lock if it was granted.
    fn abandon(&self, name: &str, request: u64) {
        {
            let mut client = self.client();
            if client.waiting.get(name).is_some_and(|w| w.request == request) {
                client.waiting.remove(name);
            }
        }
        let channel = self.channel.clone();
        let rpc_timeout = self.rpc_timeout;
        let cancel = LockMessage::Table(TableRequest::Cancel {
            name: name.to_string(),
            request,
        });
        tokio::spawn(async move {
            let Some(coordinator) = channel.view().coordinator().cloned() else {
                return;
            };
            let result: ClusterResult<LockReply> =
                call_typed(channel.as_ref(), &coordinator, LOCK_SERVICE, &cancel, rpc_timeout).await;
            if let Err(e) = result {
                debug!(error = %e, "lock cancel not delivered");
            }
        });
    }

    /// Interrupt path: cancel a queued request, or release a grant that
    /// raced the interrupt.
    async fn give_up(&self, name: &str, request: u64) {
        let still_waiting = {
            let mut client = self.client();
            if client.waiting.get(name).is_some_and(|w| w.request == request) {
                client.waiting.remove(name);
                true
            } else {
                false
            }
        };
        if still_waiting {
            self.abandon(name, request);
        } else if self.client().held.get(name) == Some(&request) {
            debug!(lock = %name, "releasing grant that raced the interrupt");
            if let Err(e) = self.release(name).await {
                warn!(lock = %name, error = %e, "failed to release raced grant");
            }
        }
    }

    fn on_grant(&self, from: &Address, name: String, request: u64) -> bool {
        let mut client = self.client();
        if !self.channel.view().is_coordinator(from) {
            warn!(lock = %name, %from, "grant from a member that is not the coordinator");
            return false;
        }
        if !client.waiting.get(&name).is_some_and(|w| w.request == request) {
            return false;
        }
        let Some(waiter) = client.waiting.remove(&name) else {
            return false;
        };
        if waiter.grant_tx.send(()).is_err() {
            return false;
        }
        client.held.insert(name, request);
        true
    }

    fn snapshot(&self) -> LockReply {
        let client = self.client();
        LockReply::Snapshot {
            held: client.held.iter().map(|(n, r)| (n.clone(), *r)).collect(),
            pending: client
                .waiting
                .iter()
                .map(|(n, w)| (n.clone(), w.request))
                .collect(),
        }
    }

    // ── Coordinator side ───────────────────────────────────────────

    async fn wait_ready(&self) -> ClusterResult<()> {
        let mut ready = self.ready_tx.subscribe();
        loop {
            if !self.channel.view().is_coordinator(self.local()) {
                return Err(ClusterError::Unavailable(format!(
                    "{} is not the lock coordinator",
                    self.local()
                )));
            }
            if *ready.borrow_and_update() {
                return Ok(());
            }
            if ready.changed().await.is_err() {
                return Err(ClusterError::Unavailable("lock service stopped".to_string()));
            }
        }
    }

    async fn serve(self: &Arc<Self>, from: Address, message: LockMessage) -> ClusterResult<LockReply> {
        let request = match message {
            LockMessage::Member(MemberRequest::Grant { name, request }) => {
                let accepted = self.on_grant(&from, name, request);
                return Ok(LockReply::GrantAck { accepted });
            }
            LockMessage::Member(MemberRequest::Snapshot) => return Ok(self.snapshot()),
            LockMessage::Table(request) => request,
        };

        self.wait_ready().await?;
        let (reply, grant) = {
            let mut table = self.table();
            match request {
                TableRequest::Acquire { name, request, wait } => {
                    let owner = Owner {
                        address: from,
                        request,
                    };
                    let entry = table.entries.entry(name).or_default();
                    match &entry.holder {
                        None => {
                            entry.holder = Some(owner);
                            (LockReply::Granted, None)
                        }
                        // Stale hold left behind by a lost reply.
                        Some(h) if h.address == owner.address => {
                            entry.holder = Some(owner);
                            (LockReply::Granted, None)
                        }
                        Some(h) if !wait => (
                            LockReply::Busy {
                                holder: h.address.clone(),
                            },
                            None,
                        ),
                        Some(_) => {
                            if !entry.queue.contains(&owner) {
                                entry.queue.push_back(owner);
                            }
                            (LockReply::Queued, None)
                        }
                    }
                }
                TableRequest::Release { name } => {
                    let holds = table
                        .entries
                        .get(&name)
                        .and_then(|e| e.holder.as_ref())
                        .is_some_and(|h| h.address == from);
                    if holds {
                        if let Some(entry) = table.entries.get_mut(&name) {
                            entry.holder = None;
                        }
                        let next = table.grant_next(&name).map(|o| (name, o));
                        (LockReply::Released { released: true }, next)
                    } else {
                        (LockReply::Released { released: false }, None)
                    }
                }
                TableRequest::Cancel { name, request } => {
                    let owner = Owner {
                        address: from,
                        request,
                    };
                    if let Some(entry) = table.entries.get_mut(&name) {
                        entry.queue.retain(|o| o != &owner);
                    }
                    let next = table.release_if(&name, &owner).map(|o| (name, o));
                    (LockReply::Cancelled, next)
                }
                TableRequest::Holder { name } => {
                    let holder = table
                        .entries
                        .get(&name)
                        .and_then(|e| e.holder.as_ref())
                        .map(|h| h.address.clone());
                    (LockReply::Holder { holder }, None)
                }
            }
        };
        if let Some((name, owner)) = grant {
            self.notify_grant(name, owner);
        }
        Ok(reply)
    }

    /// Push a grant to a queued owner; a decline hands the lock on.
    fn notify_grant(self: &Arc<Self>, name: String, owner: Owner) {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut next = Some((name, owner));
            while let Some((name, owner)) = next.take() {
                let grant = LockMessage::Member(MemberRequest::Grant {
                    name: name.clone(),
                    request: owner.request,
                });
                let reply: ClusterResult<LockReply> = call_typed(
                    inner.channel.as_ref(),
                    &owner.address,
                    LOCK_SERVICE,
                    &grant,
                    inner.rpc_timeout,
                )
                .await;
                let declined = match reply {
                    Ok(LockReply::GrantAck { accepted }) => !accepted,
                    Ok(other) => {
                        warn!(lock = %name, reply = ?other, "unexpected grant reply");
                        true
                    }
                    // The holder may have accepted; keep it unless it is gone.
                    Err(e) => {
                        warn!(lock = %name, holder = %owner.address, error = %e, "grant not acknowledged");
                        !inner.channel.view().contains(&owner.address)
                    }
                };
                if declined {
                    debug!(lock = %name, holder = %owner.address, "grant declined");
                    next = inner.table().release_if(&name, &owner).map(|o| (name, o));
                } else {
                    debug!(lock = %name, holder = %owner.address, "grant delivered");
                }
            }
        });
    }

    async fn follow_views(self: Arc<Self>) {
        let mut views = self.channel.subscribe_view();
        loop {
            let view = views.borrow_and_update().clone();
            self.on_view(view).await;
            if views.changed().await.is_err() {
                break;
            }
        }
    }

    async fn on_view(self: &Arc<Self>, view: View) {
        let local = self.local().clone();
        if !view.is_coordinator(&local) {
            let mut table = self.table();
            if table.authoritative {
                info!(view = view.id, "no longer lock coordinator");
            }
            *table = LockTable::default();
            self.ready_tx.send_replace(false);
            return;
        }

        let grants = if self.table().authoritative {
            self.table().purge(&view)
        } else {
            info!(view = view.id, members = view.members.len(), "rebuilding lock table as coordinator");
            let rebuilt = self.collect_table(&view).await;
            let mut table = self.table();
            *table = rebuilt;
            table.authoritative = true;
            let grants = table.purge(&view);
            self.ready_tx.send_replace(true);
            grants
        };
        for (name, owner) in grants {
            self.notify_grant(name, owner);
        }
    }

    /// Ask every member which locks it holds and waits on.
    async fn collect_table(&self, view: &View) -> LockTable {
        let replies: Vec<(Address, ClusterResult<LockReply>)> = match broadcast_typed(
            self.channel.as_ref(),
            LOCK_SERVICE,
            &LockMessage::Member(MemberRequest::Snapshot),
            CallMode::AllResponses,
            self.rpc_timeout,
        )
        .await
        {
            Ok(replies) => replies,
            Err(e) => {
                warn!(error = %e, "lock snapshot broadcast failed");
                Vec::new()
            }
        };

        let mut table = LockTable::default();
        let mut pending_all = Vec::new();
        for (member, reply) in replies {
            match reply {
                Ok(LockReply::Snapshot { held, pending }) => {
                    for (name, request) in held {
                        let entry = table.entries.entry(name.clone()).or_default();
                        match &entry.holder {
                            Some(existing) => {
                                warn!(lock = %name, existing = %existing.address, claimant = %member, "conflicting lock claims");
                            }
                            None => {
                                entry.holder = Some(Owner {
                                    address: member.clone(),
                                    request,
                                });
                            }
                        }
                    }
                    for (name, request) in pending {
                        pending_all.push((name, member.clone(), request));
                    }
                }
                Ok(other) => warn!(%member, reply = ?other, "unexpected snapshot reply"),
                Err(e) => warn!(%member, error = %e, "member did not report its locks"),
            }
        }

        pending_all.sort_by_key(|(_, member, request)| {
            (view.members.iter().position(|m| m == member), *request)
        });
        for (name, address, request) in pending_all {
            table
                .entries
                .entry(name)
                .or_default()
                .queue
                .push_back(Owner { address, request });
        }
        table
    }
}

fn unexpected(reply: &LockReply) -> ClusterError {
    ClusterError::Remote(format!("unexpected lock reply: {reply:?}"))
}

async fn interrupted(interrupt: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = interrupt else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

async fn left_view(views: &mut watch::Receiver<View>, local: &Address) {
    loop {
        if !views.borrow_and_update().contains(local) {
            return;
        }
        if views.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

struct LockRpc {
    inner: Weak<LockInner>,
}

#[async_trait]
impl RpcHandler for LockRpc {
    async fn handle(&self, from: Address, payload: Vec<u8>) -> ClusterResult<Vec<u8>> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| ClusterError::Unavailable("lock service stopped".to_string()))?;
        let message: LockMessage = decode(&payload)?;
        let reply = inner.serve(from, message).await?;
        encode(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{FabricEndpoint, InProcessFabric};

    const RPC: Duration = Duration::from_secs(2);

    fn node(fabric: &InProcessFabric, name: &str) -> (Arc<FabricEndpoint>, LockService) {
        let endpoint = fabric.join(name).unwrap();
        let locks = LockService::start(endpoint.clone(), RPC);
        (endpoint, locks)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_node_lock_and_unlock() {
        let fabric = InProcessFabric::new("locks");
        let (_a, locks) = node(&fabric, "a");

        locks.lock("master").await.unwrap();
        assert!(locks.is_held("master"));
        assert_eq!(locks.holder("master").await.unwrap(), Some(Address::new("a")));

        assert!(locks.unlock("master").await.unwrap());
        assert!(!locks.unlock("master").await.unwrap());
        assert_eq!(locks.holder("master").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn try_lock_reports_busy() {
        let fabric = InProcessFabric::new("locks");
        let (_a, a) = node(&fabric, "a");
        let (_b, b) = node(&fabric, "b");

        assert!(a.try_lock("x").await.unwrap());
        assert!(!b.try_lock("x").await.unwrap());
        a.unlock("x").await.unwrap();
        assert!(b.try_lock("x").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queued_waiter_gets_lock_after_unlock() {
        let fabric = InProcessFabric::new("locks");
        let (_a, a) = node(&fabric, "a");
        let (_b, b) = node(&fabric, "b");

        a.lock("x").await.unwrap();
        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.lock("x").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        a.unlock("x").await.unwrap();
        waiter.await.unwrap().unwrap();
        assert!(b.is_held("x"));
        assert_eq!(a.holder("x").await.unwrap(), Some(Address::new("b")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn departed_holder_releases_to_waiter() {
        let fabric = InProcessFabric::new("locks");
        let (_a, a) = node(&fabric, "a");
        let (b_endpoint, b) = node(&fabric, "b");
        let (_c, c) = node(&fabric, "c");

        b.lock("x").await.unwrap();
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.lock("x").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        b_endpoint.leave().await;
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(a.holder("x").await.unwrap(), Some(Address::new("c")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn new_coordinator_keeps_existing_holder() {
        let fabric = InProcessFabric::new("locks");
        let (a_endpoint, _a) = node(&fabric, "a");
        let (_b, b) = node(&fabric, "b");
        let (_c, c) = node(&fabric, "c");

        b.lock("x").await.unwrap();
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.lock("x").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The coordinator leaves; `b` takes over and rebuilds the table.
        a_endpoint.leave().await;
        assert_eq!(b.holder("x").await.unwrap(), Some(Address::new("b")));
        assert!(!waiter.is_finished());

        b.unlock("x").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(b.holder("x").await.unwrap(), Some(Address::new("c")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interrupted_waiter_leaves_the_queue() {
        let fabric = InProcessFabric::new("locks");
        let (_a, a) = node(&fabric, "a");
        let (_b, b) = node(&fabric, "b");
        let (_c, c) = node(&fabric, "c");

        a.lock("x").await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.lock_interruptibly("x", stop_rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, ClusterError::Interrupted("x".to_string()));

        // Give the cancel a moment to reach the coordinator.
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.unlock("x").await.unwrap();
        c.lock("x").await.unwrap();
        assert_eq!(a.holder("x").await.unwrap(), Some(Address::new("c")));
        assert!(!b.is_held("x"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn local_callers_are_serialised() {
        let fabric = InProcessFabric::new("locks");
        let (_a, a) = node(&fabric, "a");

        a.lock("x").await.unwrap();
        let second = {
            let a = a.clone();
            tokio::spawn(async move { a.lock("x").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        a.unlock("x").await.unwrap();
        second.await.unwrap().unwrap();
        assert!(a.is_held("x"));
    }
}
