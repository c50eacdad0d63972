//! solvergrid-state — persistence boundary for SolverGrid sessions.
//!
//! Backed by [redb](https://docs.rs/redb), stores the catalog snapshot of
//! each academic session (offerings, reservations, students with their
//! requests and enrollments) and applies enrollment write-backs.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Child records use `{session_id}:{id}` keys so one session can be loaded
//! with a prefix scan. Loading and committing are each one transaction, so
//! the scheduler sees them as all-or-nothing.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{SessionStore, StateStore};
pub use types::*;
