//! Error types for the sectioning engine.
//!
//! Scheduling infeasibility is not an error; it is reported as a
//! `SectioningOutcome`. These errors cover requests that cannot be
//! evaluated at all.

use thiserror::Error;

use solvergrid_state::{RequestId, StudentId};

pub type SectioningResult<T> = Result<T, SectioningError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SectioningError {
    #[error("unknown student {0}")]
    UnknownStudent(StudentId),

    #[error("student {student_id} has no course request {request_id}")]
    UnknownRequest {
        student_id: StudentId,
        request_id: RequestId,
    },

    #[error("invalid selection transition: {0}")]
    InvalidTransition(String),
}
