//! Identifiers and enums shared by every SolverGrid crate.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Key of a solver instance inside its container (session id or user id).
pub type SolverKey = String;

/// Identifier of an academic session whose catalog is loaded by a solver.
pub type SessionId = String;

/// The kinds of long-lived solver sessions a node can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    CourseTimetabling,
    Examination,
    StudentSectioning,
    OnlineSectioning,
}

impl SolverKind {
    pub const ALL: [SolverKind; 4] = [
        SolverKind::CourseTimetabling,
        SolverKind::Examination,
        SolverKind::StudentSectioning,
        SolverKind::OnlineSectioning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SolverKind::CourseTimetabling => "course_timetabling",
            SolverKind::Examination => "examination",
            SolverKind::StudentSectioning => "student_sectioning",
            SolverKind::OnlineSectioning => "online_sectioning",
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown solver kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown solver kind: {0}")]
pub struct UnknownSolverKind(pub String);

impl FromStr for SolverKind {
    type Err = UnknownSolverKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SolverKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownSolverKind(s.to_string()))
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solver_kind_parses_its_own_name() {
        for kind in SolverKind::ALL {
            assert_eq!(kind.as_str().parse::<SolverKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = "timetable".parse::<SolverKind>().unwrap_err();
        assert_eq!(err.0, "timetable");
    }

    #[test]
    fn solver_kind_serializes_snake_case() {
        let json = serde_json::to_string(&SolverKind::OnlineSectioning).unwrap();
        assert_eq!(json, "\"online_sectioning\"");
    }

    #[test]
    fn epoch_secs_returns_reasonable_value() {
        // Should be after 2024-01-01.
        assert!(epoch_secs() > 1_704_067_200);
    }
}
