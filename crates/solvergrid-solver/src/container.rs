//! Solver containers: one per solver kind on every node.
//!
//! A container owns the instances of its kind on the local node, keyed by
//! `SolverKey`. Creation is idempotent per key. The same trait is
//! implemented by `RemoteSolverContainer`, so callers do not care which node
//! holds the instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use solvergrid_cluster::Address;
use solvergrid_core::{SolverKey, SolverKind, epoch_secs};

use crate::error::{SolverError, SolverResult};
use crate::solver::{ManagedSolver, SolverConfig, SolverFactory, SolverInfo};

#[async_trait]
pub trait SolverContainer: Send + Sync {
    fn kind(&self) -> SolverKind;

    /// Create the instance for `key`, or report the one that already exists.
    async fn create_solver(&self, key: &str, config: SolverConfig) -> SolverResult<SolverInfo>;

    async fn get_solver(&self, key: &str) -> SolverResult<Option<SolverInfo>>;

    async fn has_solver(&self, key: &str) -> SolverResult<bool>;

    /// Returns false if there was nothing to remove.
    async fn remove_solver(&self, key: &str) -> SolverResult<bool>;

    async fn solver_keys(&self) -> SolverResult<Vec<SolverKey>>;

    async fn list_solvers(&self) -> SolverResult<Vec<SolverInfo>>;

    /// Number of live instances.
    async fn usage(&self) -> SolverResult<u32>;

    async fn refresh_solver(&self, key: &str) -> SolverResult<SolverInfo>;

    /// Remove instances unused for at least `max_idle`.
    async fn evict_idle(&self, max_idle: Duration) -> SolverResult<Vec<SolverKey>>;
}

// ── Local container ────────────────────────────────────────────────

struct Slot<S> {
    solver: Arc<S>,
    created_at: u64,
    last_used: AtomicU64,
}

impl<S> Slot<S> {
    fn touch(&self) {
        self.last_used.store(epoch_secs(), Ordering::Relaxed);
    }
}

/// Owns the instances of one kind on this node.
pub struct LocalSolverContainer<S: ManagedSolver> {
    kind: SolverKind,
    host: Address,
    memory_per_solver: u64,
    factory: Arc<dyn SolverFactory<S>>,
    slots: RwLock<HashMap<SolverKey, Slot<S>>>,
    /// Serialises creation so a key is built at most once.
    create_gate: Mutex<()>,
}

impl<S: ManagedSolver> LocalSolverContainer<S> {
    pub fn new(kind: SolverKind, host: Address, memory_per_solver: u64, factory: Arc<dyn SolverFactory<S>>) -> Self {
        Self {
            kind,
            host,
            memory_per_solver,
            factory,
            slots: RwLock::new(HashMap::new()),
            create_gate: Mutex::new(()),
        }
    }

    /// The instance for `key`, marking it used.
    pub async fn solver(&self, key: &str) -> Option<Arc<S>> {
        let slots = self.slots.read().await;
        slots.get(key).map(|slot| {
            slot.touch();
            slot.solver.clone()
        })
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Estimated memory held by this container's instances.
    pub async fn memory_bytes(&self) -> u64 {
        self.len().await as u64 * self.memory_per_solver
    }

    fn info(&self, slot: &Slot<S>) -> SolverInfo {
        SolverInfo {
            kind: self.kind,
            key: slot.solver.key().to_string(),
            host: self.host.clone(),
            created_at: slot.created_at,
            loaded_at: slot.solver.loaded_at(),
            last_used: slot.last_used.load(Ordering::Relaxed),
            memory_bytes: self.memory_per_solver,
            summary: slot.solver.summary(),
        }
    }

    async fn take(&self, key: &str) -> Option<Arc<S>> {
        self.slots.write().await.remove(key).map(|slot| slot.solver)
    }
}

#[async_trait]
impl<S: ManagedSolver> SolverContainer for LocalSolverContainer<S> {
    fn kind(&self) -> SolverKind {
        self.kind
    }

    async fn create_solver(&self, key: &str, config: SolverConfig) -> SolverResult<SolverInfo> {
        let _gate = self.create_gate.lock().await;
        if let Some(slot) = self.slots.read().await.get(key) {
            debug!(kind = %self.kind, %key, "solver already exists");
            return Ok(self.info(slot));
        }

        let solver = self.factory.create(key, &config).await?;
        let now = epoch_secs();
        let slot = Slot {
            solver: Arc::new(solver),
            created_at: now,
            last_used: AtomicU64::new(now),
        };
        let info = self.info(&slot);
        self.slots.write().await.insert(key.to_string(), slot);
        info!(kind = %self.kind, %key, host = %self.host, "solver created");
        Ok(info)
    }

    async fn get_solver(&self, key: &str) -> SolverResult<Option<SolverInfo>> {
        Ok(self.slots.read().await.get(key).map(|slot| self.info(slot)))
    }

    async fn has_solver(&self, key: &str) -> SolverResult<bool> {
        Ok(self.slots.read().await.contains_key(key))
    }

    async fn remove_solver(&self, key: &str) -> SolverResult<bool> {
        match self.take(key).await {
            Some(solver) => {
                solver.dispose().await;
                info!(kind = %self.kind, %key, "solver removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn solver_keys(&self) -> SolverResult<Vec<SolverKey>> {
        let mut keys: Vec<SolverKey> = self.slots.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn list_solvers(&self) -> SolverResult<Vec<SolverInfo>> {
        let slots = self.slots.read().await;
        let mut infos: Vec<SolverInfo> = slots.values().map(|slot| self.info(slot)).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }

    async fn usage(&self) -> SolverResult<u32> {
        Ok(self.len().await as u32)
    }

    async fn refresh_solver(&self, key: &str) -> SolverResult<SolverInfo> {
        let solver = self.solver(key).await.ok_or_else(|| SolverError::NotFound {
            kind: self.kind,
            key: key.to_string(),
        })?;
        solver.refresh().await?;
        let slots = self.slots.read().await;
        let slot = slots.get(key).ok_or_else(|| SolverError::NotFound {
            kind: self.kind,
            key: key.to_string(),
        })?;
        Ok(self.info(slot))
    }

    async fn evict_idle(&self, max_idle: Duration) -> SolverResult<Vec<SolverKey>> {
        let now = epoch_secs();
        let idle: Vec<SolverKey> = {
            let slots = self.slots.read().await;
            slots
                .iter()
                .filter(|(_, slot)| now.saturating_sub(slot.last_used.load(Ordering::Relaxed)) >= max_idle.as_secs())
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut evicted = Vec::with_capacity(idle.len());
        for key in idle {
            if let Some(solver) = self.take(&key).await {
                solver.dispose().await;
                warn!(kind = %self.kind, %key, idle_secs = max_idle.as_secs(), "idle solver evicted");
                evicted.push(key);
            }
        }
        Ok(evicted)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn create_is_idempotent_per_key() {
        let factory = Arc::new(CountingFactory::default());
        let container = container(factory.clone());

        let first = container.create_solver("fall", SolverConfig::default()).await.unwrap();
        let second = container.create_solver("fall", SolverConfig::default()).await.unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(container.usage().await.unwrap(), 1);
        assert_eq!(container.memory_bytes().await, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_build_once() {
        let factory = Arc::new(CountingFactory::default());
        let container = Arc::new(container(factory.clone()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let container = container.clone();
            tasks.push(tokio::spawn(async move {
                container.create_solver("fall", SolverConfig::default()).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_and_lookup() {
        let container = container(Arc::new(CountingFactory::default()));
        container.create_solver("spring", SolverConfig::default()).await.unwrap();
        container.create_solver("fall", SolverConfig::default()).await.unwrap();

        assert_eq!(container.solver_keys().await.unwrap(), vec!["fall", "spring"]);
        assert!(container.has_solver("fall").await.unwrap());
        assert!(container.remove_solver("fall").await.unwrap());
        assert!(!container.remove_solver("fall").await.unwrap());
        assert!(container.get_solver("fall").await.unwrap().is_none());
        assert_eq!(container.list_solvers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refresh_reaches_the_instance() {
        let container = container(Arc::new(CountingFactory::default()));
        container.create_solver("fall", SolverConfig::default()).await.unwrap();

        let info = container.refresh_solver("fall").await.unwrap();
        assert_eq!(info.summary["refreshes"], "1");

        let err = container.refresh_solver("winter").await.unwrap_err();
        assert!(matches!(err, SolverError::NotFound { .. }));
    }

    #[tokio::test]
    async fn evict_idle_honours_the_timeout() {
        let container = container(Arc::new(CountingFactory::default()));
        container.create_solver("fall", SolverConfig::default()).await.unwrap();

        let kept = container.evict_idle(Duration::from_secs(3_600)).await.unwrap();
        assert!(kept.is_empty());

        let evicted = container.evict_idle(Duration::ZERO).await.unwrap();
        assert_eq!(evicted, vec!["fall"]);
        assert_eq!(container.usage().await.unwrap(), 0);
    }
}
