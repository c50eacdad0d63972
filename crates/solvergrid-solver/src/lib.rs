//! solvergrid-solver — long-lived solver sessions spread over the cluster.
//!
//! # Architecture
//!
//! ```text
//! SolverServer (one per node, "solver" service)
//!   ├── LocalSolverContainer per SolverKind
//!   │   ├── OnlineSectioningSolver    (online_sectioning)
//!   │   └── OptimizationSession       (course_timetabling, examination, student_sectioning)
//!   ├── find / create / remove / list across members
//!   │   └── RemoteSolverServer → RemoteSolverContainer, RemoteSectioningClient
//!   ├── placement: IsAvailable broadcast, uniform random pick,
//!   │              creation lock "create/{kind}/{key}" + re-query
//!   └── shutdown: stop accepting, drain, step down, leave
//!
//! Coordinator (tick every scan interval)
//!   ├── master:  auto-start sessions without a solver
//!   ├── updater: reload solvers whose session changed
//!   └── all:     evict idle solvers
//! ```

pub mod container;
pub mod coordinator;
pub mod error;
pub mod placement;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod sessions;
pub mod solver;

pub use container::{LocalSolverContainer, SolverContainer};
pub use coordinator::{Coordinator, TickReport};
pub use error::{SolverError, SolverResult};
pub use placement::{ClusterLoad, NodeInfo};
pub use remote::{RemoteSectioningClient, RemoteSolverContainer, RemoteSolverServer};
pub use server::{ServerSettings, SolverServer};
pub use sessions::{BatchItem, BatchOutcome, OnlineSectioningSolver, OptimizationSession};
pub use solver::{ManagedSolver, SolverConfig, SolverInfo};
