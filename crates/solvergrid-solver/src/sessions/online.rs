//! The online-sectioning solver: one session's catalog kept in memory.
//!
//! A batch is wrapped into `SectioningRequest`s, sorted, grouped per
//! student and decided by up to `workers` blocking tasks. Every decision
//! takes the catalog mutex once, for the whole enumerate-filter-score-apply
//! window. Changed enrollments are committed in one store transaction after
//! the batch; when the commit fails the catalog is reloaded from the store.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use solvergrid_core::config::SectioningConfig;
use solvergrid_core::{SessionId, SolverKey, SolverKind, epoch_secs};
use solvergrid_sectioning::{
    AuditSink, Catalog, Scheduler, SectioningAction, SectioningOutcome, SectioningRequest, Subject, request_rng,
};
use solvergrid_state::{EnrollmentChange, RequestId, SessionStore, StudentId};

use crate::error::{SolverError, SolverResult};
use crate::solver::{ManagedSolver, SolverConfig, SolverFactory};

/// One request of a sectioning batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub student_id: StudentId,
    pub request_id: RequestId,
    pub action: SectioningAction,
    pub subject: Subject,
}

impl BatchItem {
    pub fn new(student_id: StudentId, request_id: RequestId, action: SectioningAction, subject: Subject) -> Self {
        Self {
            student_id,
            request_id,
            action,
            subject,
        }
    }
}

/// Result for one `BatchItem`, in batch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub student_id: StudentId,
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SectioningOutcome>,
    /// Set when the request could not be evaluated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchOutcome {
    fn decided(student_id: StudentId, request_id: RequestId, outcome: SectioningOutcome) -> Self {
        Self {
            student_id,
            request_id,
            outcome: Some(outcome),
            error: None,
        }
    }

    fn failed(student_id: StudentId, request_id: RequestId, error: impl ToString) -> Self {
        Self {
            student_id,
            request_id,
            outcome: None,
            error: Some(error.to_string()),
        }
    }
}

struct Job {
    index: usize,
    request: SectioningRequest,
    subject: Subject,
}

pub struct OnlineSectioningSolver {
    key: SolverKey,
    session_id: SessionId,
    workers: usize,
    seed: u64,
    store: Arc<dyn SessionStore>,
    scheduler: Arc<Scheduler>,
    catalog: Arc<Mutex<Catalog>>,
    /// One batch (or reload) at a time.
    batch_gate: tokio::sync::Mutex<()>,
    loaded_at: AtomicU64,
    batches: AtomicU64,
    decisions: AtomicU64,
}

impl OnlineSectioningSolver {
    pub fn load(
        key: impl Into<SolverKey>,
        session_id: impl Into<SessionId>,
        store: Arc<dyn SessionStore>,
        scheduler: Arc<Scheduler>,
        config: &SectioningConfig,
    ) -> SolverResult<Self> {
        let session_id = session_id.into();
        let catalog = load_catalog(store.as_ref(), &scheduler, &session_id)?;
        info!(
            session = %session_id,
            students = catalog.student_count(),
            offerings = catalog.offering_count(),
            "sectioning session loaded"
        );
        Ok(Self {
            key: key.into(),
            session_id,
            workers: config.workers.max(1),
            seed: config.seed,
            store,
            scheduler,
            catalog: Arc::new(Mutex::new(catalog)),
            batch_gate: tokio::sync::Mutex::new(()),
            loaded_at: AtomicU64::new(epoch_secs()),
            batches: AtomicU64::new(0),
            decisions: AtomicU64::new(0),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run `f` against the current catalog.
    pub fn with_catalog<T>(&self, f: impl FnOnce(&Catalog) -> T) -> T {
        f(&lock(&self.catalog))
    }

    /// Decide a batch of requests and persist the resulting changes.
    pub async fn section(&self, batch: Vec<BatchItem>) -> SolverResult<Vec<BatchOutcome>> {
        let _batch = self.batch_gate.lock().await;
        let size = batch.len();
        let mut outcomes: Vec<Option<BatchOutcome>> = vec![None; size];

        let mut jobs = Vec::with_capacity(size);
        {
            let catalog = lock(&self.catalog);
            for (index, item) in batch.into_iter().enumerate() {
                match SectioningRequest::build(
                    &catalog,
                    item.student_id,
                    item.request_id,
                    item.action,
                    item.subject.user.clone(),
                ) {
                    Ok(request) => jobs.push(Job {
                        index,
                        request,
                        subject: item.subject,
                    }),
                    Err(e) => outcomes[index] = Some(BatchOutcome::failed(item.student_id, item.request_id, e)),
                }
            }
        }
        jobs.sort_by(|a, b| a.request.cmp(&b.request));

        let groups = group_by_student(jobs);
        let workers = self.workers.min(groups.len()).max(1);
        let queue = Arc::new(Mutex::new(groups));
        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            let queue = queue.clone();
            let catalog = self.catalog.clone();
            let scheduler = self.scheduler.clone();
            let seed = self.seed;
            tasks.spawn_blocking(move || run_worker(&queue, &catalog, &scheduler, seed));
        }

        let mut worker_failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(decided) => {
                    for (index, outcome) in decided {
                        outcomes[index] = Some(outcome);
                    }
                }
                Err(e) => worker_failure = Some(e.to_string()),
            }
        }
        if let Some(message) = worker_failure {
            error!(session = %self.session_id, error = %message, "sectioning worker failed, reloading session");
            self.reload_after_failure().await;
            return Err(SolverError::Worker(message));
        }

        let outcomes: Vec<BatchOutcome> = outcomes.into_iter().flatten().collect();
        let changes = self.collect_changes(&outcomes);
        if !changes.is_empty() {
            if let Err(e) = self.store.commit_enrollments(&self.session_id, &changes) {
                error!(session = %self.session_id, error = %e, "enrollment commit failed, reloading session");
                self.reload_after_failure().await;
                return Err(e.into());
            }
        }

        self.batches.fetch_add(1, Ordering::Relaxed);
        self.decisions.fetch_add(size as u64, Ordering::Relaxed);
        debug!(session = %self.session_id, requests = size, changes = changes.len(), "batch sectioned");
        Ok(outcomes)
    }

    /// Reload the session from the store, replacing the in-memory catalog.
    pub async fn reload(&self) -> SolverResult<()> {
        let _batch = self.batch_gate.lock().await;
        let catalog = self.load_blocking().await?;
        *lock(&self.catalog) = catalog;
        self.loaded_at.store(epoch_secs(), Ordering::Relaxed);
        info!(session = %self.session_id, "sectioning session reloaded");
        Ok(())
    }

    async fn reload_after_failure(&self) {
        match self.load_blocking().await {
            Ok(catalog) => {
                *lock(&self.catalog) = catalog;
                self.loaded_at.store(epoch_secs(), Ordering::Relaxed);
            }
            Err(e) => error!(session = %self.session_id, error = %e, "reload from store failed"),
        }
    }

    /// Read the session on the blocking pool.
    async fn load_blocking(&self) -> SolverResult<Catalog> {
        let store = self.store.clone();
        let scheduler = self.scheduler.clone();
        let session_id = self.session_id.clone();
        tokio::task::spawn_blocking(move || load_catalog(store.as_ref(), &scheduler, &session_id))
            .await
            .map_err(|e| SolverError::Worker(format!("session load task failed: {e}")))?
    }

    /// Current enrollments of every request the batch changed.
    fn collect_changes(&self, outcomes: &[BatchOutcome]) -> Vec<EnrollmentChange> {
        let changed: BTreeSet<(StudentId, RequestId)> = outcomes
            .iter()
            .filter(|o| o.outcome.as_ref().is_some_and(SectioningOutcome::is_change))
            .map(|o| (o.student_id, o.request_id))
            .collect();
        let catalog = lock(&self.catalog);
        changed
            .into_iter()
            .map(|(student_id, request_id)| EnrollmentChange {
                student_id,
                request_id,
                enrollment: catalog
                    .student(student_id)
                    .and_then(|s| s.course_request(request_id))
                    .and_then(|r| r.enrollment.clone()),
            })
            .collect()
    }
}

#[async_trait]
impl ManagedSolver for OnlineSectioningSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::OnlineSectioning
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn loaded_at(&self) -> u64 {
        self.loaded_at.load(Ordering::Relaxed)
    }

    fn summary(&self) -> BTreeMap<String, String> {
        let (students, offerings, enrollments) = self.with_catalog(|c| {
            (c.student_count(), c.offering_count(), c.enrollment_count())
        });
        BTreeMap::from([
            ("session".to_string(), self.session_id.clone()),
            ("students".to_string(), students.to_string()),
            ("offerings".to_string(), offerings.to_string()),
            ("enrollments".to_string(), enrollments.to_string()),
            ("batches".to_string(), self.batches.load(Ordering::Relaxed).to_string()),
            ("decisions".to_string(), self.decisions.load(Ordering::Relaxed).to_string()),
        ])
    }

    async fn refresh(&self) -> SolverResult<()> {
        self.reload().await
    }

    async fn dispose(&self) {
        debug!(session = %self.session_id, "sectioning session unloaded");
    }
}

fn lock(catalog: &Mutex<Catalog>) -> MutexGuard<'_, Catalog> {
    catalog.lock().unwrap_or_else(|e| e.into_inner())
}

fn load_catalog(store: &dyn SessionStore, scheduler: &Scheduler, session_id: &str) -> SolverResult<Catalog> {
    let snapshot = store.load_session(session_id)?;
    let mut catalog = Catalog::from_snapshot(snapshot);
    scheduler.space().recompute_expected(&mut catalog);
    Ok(catalog)
}

/// Per-student groups, ordered by each student's first request.
fn group_by_student(jobs: Vec<Job>) -> VecDeque<Vec<Job>> {
    let mut groups: Vec<Vec<Job>> = Vec::new();
    let mut position: HashMap<StudentId, usize> = HashMap::new();
    for job in jobs {
        let slot = *position.entry(job.request.student_id).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(job);
    }
    groups.into()
}

fn run_worker(
    queue: &Mutex<VecDeque<Vec<Job>>>,
    catalog: &Mutex<Catalog>,
    scheduler: &Scheduler,
    seed: u64,
) -> Vec<(usize, BatchOutcome)> {
    let mut decided = Vec::new();
    loop {
        let Some(group) = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front() else {
            break;
        };
        for job in group {
            let Job {
                index,
                request,
                subject,
            } = job;
            let mut rng = request_rng(seed, request.student_id, request.request_id);
            let result = {
                let mut catalog = lock(catalog);
                scheduler.decide(&mut catalog, &request, &subject, &mut rng, epoch_secs())
            };
            let outcome = match result {
                Ok(outcome) => BatchOutcome::decided(request.student_id, request.request_id, outcome),
                Err(e) => {
                    warn!(student = request.student_id, request = request.request_id, error = %e, "request not evaluated");
                    BatchOutcome::failed(request.student_id, request.request_id, e)
                }
            };
            decided.push((index, outcome));
        }
    }
    decided
}

// ── Factory ────────────────────────────────────────────────────────

pub struct OnlineSectioningFactory {
    store: Arc<dyn SessionStore>,
    config: SectioningConfig,
    audit: Arc<dyn AuditSink>,
}

impl OnlineSectioningFactory {
    pub fn new(store: Arc<dyn SessionStore>, config: SectioningConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, config, audit }
    }
}

#[async_trait]
impl SolverFactory<OnlineSectioningSolver> for OnlineSectioningFactory {
    async fn create(&self, key: &str, config: &SolverConfig) -> SolverResult<OnlineSectioningSolver> {
        let scheduler = Arc::new(Scheduler::new(&self.config, self.audit.clone()));
        let (key, session_id) = (key.to_string(), config.session_or(key).to_string());
        let store = self.store.clone();
        let sectioning = self.config.clone();
        tokio::task::spawn_blocking(move || OnlineSectioningSolver::load(key, session_id, store, scheduler, &sectioning))
            .await
            .map_err(|e| SolverError::Worker(format!("session load task failed: {e}")))?
    }
}
