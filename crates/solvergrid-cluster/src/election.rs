//! Leader election on top of the cluster lock service.
//!
//! One elector per coordinator role. The election task blocks on the
//! role's lock; once it returns, this node holds the role until it is
//! stopped or drops out of the view. Acquisition failures on the channel
//! are retried after `retry_delay`.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Address, View};
use crate::error::ClusterError;
use crate::lock::LockService;

/// Cluster-wide roles backed by a well-known lock name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorRole {
    /// Runs coordination duties (auto-start scans).
    Master,
    /// Applies catalog updates to running solvers.
    Updater,
}

impl CoordinatorRole {
    pub fn lock_name(&self) -> &'static str {
        match self {
            CoordinatorRole::Master => "master",
            CoordinatorRole::Updater => "updater",
        }
    }
}

impl fmt::Display for CoordinatorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.lock_name())
    }
}

/// Current leadership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    Follower,
    Leader,
}

impl LeadershipState {
    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipState::Leader)
    }
}

/// Participates in the election for one role.
pub struct LeaderElector {
    role: CoordinatorRole,
    locks: LockService,
    retry_delay: Duration,
}

impl LeaderElector {
    pub fn new(role: CoordinatorRole, locks: LockService, retry_delay: Duration) -> Self {
        Self {
            role,
            locks,
            retry_delay,
        }
    }

    /// Start the election task.
    pub fn start(self, views: watch::Receiver<View>) -> ElectionHandle {
        let (state_tx, state_rx) = watch::channel(LeadershipState::Follower);
        let (stop_tx, stop_rx) = watch::channel(false);
        let role = self.role;
        let task = tokio::spawn(self.election_loop(state_tx, stop_rx, views));
        ElectionHandle {
            role,
            state_rx,
            stop_tx,
            task: Some(task),
        }
    }

    async fn election_loop(
        self,
        state_tx: watch::Sender<LeadershipState>,
        mut stop_rx: watch::Receiver<bool>,
        mut views: watch::Receiver<View>,
    ) {
        let lock_name = self.role.lock_name();
        let local = self.locks.local_address().clone();
        loop {
            if *stop_rx.borrow() {
                break;
            }
            match self.locks.lock_interruptibly(lock_name, stop_rx.clone()).await {
                Ok(()) => {
                    info!(role = %self.role, node = %local, "became coordinator");
                    state_tx.send_replace(LeadershipState::Leader);

                    let departed = tokio::select! {
                        _ = wait_true(&mut stop_rx) => false,
                        _ = left_view(&mut views, &local) => true,
                    };
                    state_tx.send_replace(LeadershipState::Follower);
                    if departed {
                        warn!(role = %self.role, node = %local, "left the view, stepping down");
                        break;
                    }
                    debug!(role = %self.role, "stepping down");
                    if let Err(e) = self.locks.unlock(lock_name).await {
                        warn!(role = %self.role, error = %e, "error releasing coordinator lock");
                    }
                    break;
                }
                Err(ClusterError::Interrupted(_)) => break,
                Err(e) => {
                    warn!(role = %self.role, error = %e, "election attempt failed");
                    state_tx.send_replace(LeadershipState::Follower);
                    if !views.borrow().contains(&local) {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = wait_true(&mut stop_rx) => break,
                    }
                }
            }
        }
        debug!(role = %self.role, "election loop stopped");
    }
}

/// Handle for a running election.
pub struct ElectionHandle {
    role: CoordinatorRole,
    state_rx: watch::Receiver<LeadershipState>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ElectionHandle {
    pub fn role(&self) -> CoordinatorRole {
        self.role
    }

    pub fn state(&self) -> LeadershipState {
        *self.state_rx.borrow()
    }

    /// Whether this node currently holds the role.
    pub fn is_coordinator(&self) -> bool {
        self.state().is_leader()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_rx.clone()
    }

    /// Step down (releasing the role lock) and wait for the task to end.
    pub async fn stop(&mut self) {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(role = %self.role, error = %e, "election task failed");
            }
        }
    }
}

impl Drop for ElectionHandle {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

async fn wait_true(rx: &mut watch::Receiver<bool>) {
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::channel::ClusterChannel;
    use crate::fabric::{FabricEndpoint, InProcessFabric};

    const RPC: Duration = Duration::from_secs(2);
    const RETRY: Duration = Duration::from_millis(20);

    struct Node {
        endpoint: Arc<FabricEndpoint>,
        master: ElectionHandle,
    }

    fn node(fabric: &InProcessFabric, name: &str) -> Node {
        let endpoint = fabric.join(name).unwrap();
        let locks = LockService::start(endpoint.clone(), RPC);
        let master = LeaderElector::new(CoordinatorRole::Master, locks, RETRY).start(endpoint.subscribe_view());
        Node { endpoint, master }
    }

    async fn wait_for_leader(handle: &ElectionHandle) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_leader()))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn roles_map_to_lock_names() {
        assert_eq!(CoordinatorRole::Master.lock_name(), "master");
        assert_eq!(CoordinatorRole::Updater.to_string(), "updater");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn first_node_becomes_master() {
        let fabric = InProcessFabric::new("election");
        let a = node(&fabric, "a");
        wait_for_leader(&a.master).await;
        let b = node(&fabric, "b");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.master.is_coordinator());
        assert!(!b.master.is_coordinator());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stopping_the_master_hands_over() {
        let fabric = InProcessFabric::new("election");
        let mut a = node(&fabric, "a");
        wait_for_leader(&a.master).await;
        let b = node(&fabric, "b");

        a.master.stop().await;
        assert!(!a.master.is_coordinator());
        wait_for_leader(&b.master).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn departed_master_fails_over() {
        let fabric = InProcessFabric::new("election");
        let a = node(&fabric, "a");
        wait_for_leader(&a.master).await;
        let b = node(&fabric, "b");
        let c = node(&fabric, "c");
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.endpoint.leave().await;
        let mut a_state = a.master.subscribe();
        tokio::time::timeout(Duration::from_secs(5), a_state.wait_for(|s| !s.is_leader()))
            .await
            .unwrap()
            .unwrap();

        wait_for_leader(&b.master).await;
        assert!(!c.master.is_coordinator());
        drop(c);
    }
}
