//! Solver instances hosted by the containers.

pub mod batch;
pub mod online;

pub use batch::{OptimizationFactory, OptimizationSession, SolveResult};
pub use online::{BatchItem, BatchOutcome, OnlineSectioningFactory, OnlineSectioningSolver};
