//! Periodic coordinator duties.
//!
//! On every tick:
//! - the master starts an online-sectioning solver for each `auto_start`
//!   session that has none anywhere in the cluster;
//! - the updater reloads running sectioning solvers whose session changed
//!   after they were loaded;
//! - every node unloads its own idle solvers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use solvergrid_cluster::LeadershipState;
use solvergrid_core::config::CoordinatorConfig;
use solvergrid_core::{SessionId, SolverKey, SolverKind};
use solvergrid_state::SessionStore;

use crate::error::SolverResult;
use crate::server::SolverServer;
use crate::solver::SolverConfig;

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub started: Vec<SessionId>,
    pub refreshed: Vec<SolverKey>,
    pub evicted: Vec<(SolverKind, SolverKey)>,
}

pub struct Coordinator {
    server: SolverServer,
    store: Arc<dyn SessionStore>,
    config: CoordinatorConfig,
    updater: Option<watch::Receiver<LeadershipState>>,
}

impl Coordinator {
    pub fn new(server: SolverServer, store: Arc<dyn SessionStore>, config: CoordinatorConfig) -> Self {
        Self {
            server,
            store,
            config,
            updater: None,
        }
    }

    /// Follow the updater election of this node.
    pub fn with_updater(mut self, updater: watch::Receiver<LeadershipState>) -> Self {
        self.updater = Some(updater);
        self
    }

    fn is_updater(&self) -> bool {
        self.updater.as_ref().is_some_and(|rx| rx.borrow().is_leader())
    }

    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if self.server.is_master() {
            match self.start_auto_sessions().await {
                Ok(started) => report.started = started,
                Err(e) => warn!(error = %e, "auto-start scan failed"),
            }
        }
        if self.is_updater() {
            match self.refresh_updated().await {
                Ok(refreshed) => report.refreshed = refreshed,
                Err(e) => warn!(error = %e, "session update scan failed"),
            }
        }
        if self.config.idle_timeout_secs > 0 {
            report.evicted = self
                .server
                .evict_idle(Duration::from_secs(self.config.idle_timeout_secs))
                .await;
        }
        report
    }

    /// Create missing solvers for `auto_start` sessions.
    pub async fn start_auto_sessions(&self) -> SolverResult<Vec<SessionId>> {
        let mut started = Vec::new();
        for session in self.store.list_sessions()? {
            if !session.auto_start {
                continue;
            }
            if self
                .server
                .find_solver(SolverKind::OnlineSectioning, &session.id)
                .await?
                .is_some()
            {
                continue;
            }
            match self
                .server
                .create_solver(
                    SolverKind::OnlineSectioning,
                    &session.id,
                    SolverConfig::for_session(session.id.clone()),
                )
                .await
            {
                Ok(info) => {
                    info!(session = %session.id, node = %info.host, "auto-started sectioning solver");
                    started.push(session.id);
                }
                Err(e) => warn!(session = %session.id, error = %e, "auto-start failed"),
            }
        }
        Ok(started)
    }

    /// Reload sectioning solvers whose session changed since they loaded it.
    pub async fn refresh_updated(&self) -> SolverResult<Vec<SolverKey>> {
        let sessions = self.store.list_sessions()?;
        let mut refreshed = Vec::new();
        for info in self.server.list_solvers(SolverKind::OnlineSectioning).await? {
            let session_id = info.summary.get("session").unwrap_or(&info.key);
            let Some(session) = sessions.iter().find(|s| &s.id == session_id) else {
                continue;
            };
            if session.updated_at <= info.loaded_at {
                continue;
            }
            match self.server.refresh_solver(SolverKind::OnlineSectioning, &info.key).await {
                Ok(_) => {
                    debug!(key = %info.key, node = %info.host, "sectioning solver reloaded");
                    refreshed.push(info.key);
                }
                Err(e) => warn!(key = %info.key, error = %e, "reload failed"),
            }
        }
        Ok(refreshed)
    }

    /// Tick every `scan_interval_secs` until `shutdown` changes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.scan_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report != TickReport::default() {
                        debug!(?report, "coordinator tick");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(node = %self.server.local_address(), "coordinator shutting down");
                    break;
                }
            }
        }
    }
}
