//! solvergrid-sectioning — online course sectioning.
//!
//! Schedules individual course requests against the in-memory catalog of
//! one academic session.
//!
//! # Architecture
//!
//! ```text
//! SectioningRequest (ordered batch)
//!   └── Scheduler::decide
//!       ├── RightsRegistry        enroll / change / drop / override checks
//!       ├── ResectioningSelection
//!       │   ├── Optimizer::enumerate   candidate enrollments
//!       │   ├── filters                time, deadline, reservation, capacity
//!       │   ├── Optimizer::rank        WeightFunction
//!       │   └── decide                 seeded tie-break
//!       ├── SpaceAccountant        held and expected space
//!       └── AuditSink              one DecisionRecord per decision
//! ```

pub mod audit;
pub mod catalog;
pub mod deadline;
pub mod distance;
pub mod error;
pub mod optimizer;
pub mod request;
pub mod reservation;
pub mod rights;
pub mod scheduler;
pub mod selection;
pub mod space;
pub mod weights;

pub use audit::{AuditSink, DecisionRecord, MemoryAuditSink, TracingAuditSink};
pub use catalog::Catalog;
pub use deadline::{DeadlineRule, Deadlines};
pub use error::{SectioningError, SectioningResult};
pub use optimizer::{Candidate, ExhaustiveOptimizer, Optimizer, ProblemSnapshot};
pub use request::{SectioningAction, SectioningRequest};
pub use rights::{Right, RightContext, RightsRegistry, Role, Subject};
pub use scheduler::{RejectReason, Scheduler, SectioningOutcome, request_rng};
pub use selection::{FilterReason, ResectioningSelection, SelectionDecision, UnassignedReason};
pub use space::SpaceAccountant;
pub use weights::{DefaultWeights, WeightFunction};
