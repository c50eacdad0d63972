//! Batch optimization sessions.
//!
//! Course timetabling, examination and batch student sectioning solvers are
//! black boxes here: given the session's problem instance they return a set
//! of enrollments and a scalar value. The stand-in search assigns every open
//! request once, in request order, on a private copy of the catalog.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use solvergrid_core::config::SectioningConfig;
use solvergrid_core::{SessionId, SolverKey, SolverKind, epoch_secs};
use solvergrid_sectioning::{
    Catalog, MemoryAuditSink, Scheduler, SectioningAction, SectioningOutcome, SectioningRequest, Subject, request_rng,
};
use solvergrid_state::{EnrollmentChange, RequestRecord, SessionStore};

use crate::error::{SolverError, SolverResult};
use crate::solver::{ManagedSolver, SolverConfig, SolverFactory};

/// Best solution found by the last run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveResult {
    pub enrollments: Vec<EnrollmentChange>,
    /// Share of open requests that were assigned, 1.0 when none were open.
    pub value: f64,
    pub assigned: usize,
    pub requests: usize,
    pub solved_at: u64,
}

pub struct OptimizationSession {
    kind: SolverKind,
    key: SolverKey,
    session_id: SessionId,
    store: Arc<dyn SessionStore>,
    config: SectioningConfig,
    problem: Mutex<Catalog>,
    best: Mutex<Option<SolveResult>>,
    loaded_at: AtomicU64,
}

impl OptimizationSession {
    pub fn load(
        kind: SolverKind,
        key: impl Into<SolverKey>,
        session_id: impl Into<SessionId>,
        store: Arc<dyn SessionStore>,
        config: SectioningConfig,
    ) -> SolverResult<Self> {
        let session_id = session_id.into();
        let problem = Catalog::from_snapshot(store.load_session(&session_id)?);
        Ok(Self {
            kind,
            key: key.into(),
            session_id,
            store,
            config,
            problem: Mutex::new(problem),
            best: Mutex::new(None),
            loaded_at: AtomicU64::new(epoch_secs()),
        })
    }

    pub fn best(&self) -> Option<SolveResult> {
        self.best.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run the search on a copy of the problem and keep the result.
    pub fn solve(&self) -> SolverResult<SolveResult> {
        let mut work = self.problem.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let scheduler = Scheduler::new(&self.config, Arc::new(MemoryAuditSink::new()));
        let solver = Subject::admin(format!("{}:{}", self.kind, self.key));

        let mut requests = Vec::new();
        for student in work.students() {
            for request in &student.requests {
                if let RequestRecord::Course(cr) = request {
                    if cr.enrollment.is_none() {
                        requests.push(SectioningRequest::build(
                            &work,
                            student.id,
                            cr.id,
                            SectioningAction::Enroll,
                            solver.user.clone(),
                        )?);
                    }
                }
            }
        }
        requests.sort();

        let mut enrollments = Vec::new();
        let now = epoch_secs();
        for request in &requests {
            let mut rng = request_rng(self.config.seed, request.student_id, request.request_id);
            if let SectioningOutcome::Assigned { enrollment, .. } =
                scheduler.decide(&mut work, request, &solver, &mut rng, now)?
            {
                enrollments.push(EnrollmentChange {
                    student_id: request.student_id,
                    request_id: request.request_id,
                    enrollment: Some(enrollment),
                });
            }
        }

        let result = SolveResult {
            value: if requests.is_empty() {
                1.0
            } else {
                enrollments.len() as f64 / requests.len() as f64
            },
            assigned: enrollments.len(),
            requests: requests.len(),
            enrollments,
            solved_at: now,
        };
        info!(
            kind = %self.kind,
            key = %self.key,
            assigned = result.assigned,
            requests = result.requests,
            value = result.value,
            "optimization finished"
        );
        *self.best.lock().unwrap_or_else(|e| e.into_inner()) = Some(result.clone());
        Ok(result)
    }
}

#[async_trait]
impl ManagedSolver for OptimizationSession {
    fn kind(&self) -> SolverKind {
        self.kind
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn loaded_at(&self) -> u64 {
        self.loaded_at.load(Ordering::Relaxed)
    }

    fn summary(&self) -> BTreeMap<String, String> {
        let mut summary = BTreeMap::from([("session".to_string(), self.session_id.clone())]);
        match self.best() {
            Some(best) => {
                summary.insert("status".to_string(), "solved".to_string());
                summary.insert("value".to_string(), format!("{:.3}", best.value));
                summary.insert("assigned".to_string(), best.assigned.to_string());
                summary.insert("requests".to_string(), best.requests.to_string());
            }
            None => {
                summary.insert("status".to_string(), "loaded".to_string());
            }
        }
        summary
    }

    /// Reload the problem and solve it again.
    async fn refresh(&self) -> SolverResult<()> {
        let problem = Catalog::from_snapshot(self.store.load_session(&self.session_id)?);
        *self.problem.lock().unwrap_or_else(|e| e.into_inner()) = problem;
        self.loaded_at.store(epoch_secs(), Ordering::Relaxed);
        self.solve()?;
        Ok(())
    }
}

pub struct OptimizationFactory {
    kind: SolverKind,
    store: Arc<dyn SessionStore>,
    config: SectioningConfig,
}

impl OptimizationFactory {
    pub fn new(kind: SolverKind, store: Arc<dyn SessionStore>, config: SectioningConfig) -> SolverResult<Self> {
        if kind == SolverKind::OnlineSectioning {
            return Err(SolverError::InvalidConfig(
                "online sectioning is not a batch optimization".to_string(),
            ));
        }
        Ok(Self { kind, store, config })
    }
}

#[async_trait]
impl SolverFactory<OptimizationSession> for OptimizationFactory {
    async fn create(&self, key: &str, config: &SolverConfig) -> SolverResult<OptimizationSession> {
        OptimizationSession::load(
            self.kind,
            key,
            config.session_or(key),
            self.store.clone(),
            self.config.clone(),
        )
    }
}
