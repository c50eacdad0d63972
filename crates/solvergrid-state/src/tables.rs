//! redb table definitions for the SolverGrid session store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Child records are keyed `{session_id}:{zero-padded id}`, so session ids
//! may not contain the separator.

use redb::TableDefinition;

use crate::error::{StateError, StateResult};

/// Separator between the session id and the child id of a key.
pub const KEY_SEPARATOR: char = ':';

/// Session headers keyed by `{session_id}`.
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Course offerings keyed by `{session_id}:{offering_id}`.
pub const OFFERINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("offerings");

/// Reservations keyed by `{session_id}:{reservation_id}`.
pub const RESERVATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("reservations");

/// Students (with requests and enrollments) keyed by `{session_id}:{student_id}`.
pub const STUDENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("students");

/// Reject session ids that would make one session's prefix match another's keys.
pub fn check_session_id(session_id: &str) -> StateResult<()> {
    if session_id.is_empty() {
        return Err(StateError::InvalidKey("empty session id".to_string()));
    }
    if session_id.contains(KEY_SEPARATOR) {
        return Err(StateError::InvalidKey(format!(
            "session id {session_id:?} contains '{KEY_SEPARATOR}'"
        )));
    }
    Ok(())
}

/// Build the composite key of a session child record.
pub fn child_key(session_id: &str, id: u64) -> String {
    format!("{session_id}{KEY_SEPARATOR}{id:020}")
}

/// Prefix shared by all child records of a session.
pub fn session_prefix(session_id: &str) -> String {
    format!("{session_id}{KEY_SEPARATOR}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_with_the_separator_are_rejected() {
        assert!(check_session_id("fall-2026").is_ok());
        assert!(matches!(check_session_id("a:b"), Err(StateError::InvalidKey(_))));
        assert!(matches!(check_session_id(""), Err(StateError::InvalidKey(_))));
    }

    #[test]
    fn child_keys_sort_by_id_within_a_session() {
        assert!(child_key("fall", 9) < child_key("fall", 10));
        assert!(child_key("fall", 10).starts_with(&session_prefix("fall")));
        assert!(!child_key("fall", 10).starts_with(&session_prefix("fal")));
    }
}
