//! StateStore: redb-backed session persistence for SolverGrid.
//!
//! Provides the two operations the scheduler needs from persistence
//! (load a whole session, write back a set of enrollment changes) plus
//! the CRUD used by tooling to seed sessions. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// The persistence boundary as seen by a solver instance.
///
/// Both operations are all-or-nothing: a failed commit leaves the stored
/// session exactly as it was.
pub trait SessionStore: Send + Sync {
    /// Read all non-cancelled offerings, reservations and students of a session.
    fn load_session(&self, session_id: &str) -> StateResult<SessionSnapshot>;

    /// Apply enrollment changes in a single transaction.
    fn commit_enrollments(&self, session_id: &str, changes: &[EnrollmentChange]) -> StateResult<()>;

    /// All session headers.
    fn list_sessions(&self) -> StateResult<Vec<SessionRecord>>;
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        txn.open_table(OFFERINGS).map_err(map_err!(Table))?;
        txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
        txn.open_table(STUDENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Replace a whole session (header and every child record) atomically.
    pub fn put_snapshot(&self, snapshot: &SessionSnapshot) -> StateResult<()> {
        let session_id = snapshot.session.id.as_str();
        check_session_id(session_id)?;
        let prefix = session_prefix(session_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let header = to_json(&snapshot.session)?;
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            sessions
                .insert(session_id, header.as_slice())
                .map_err(map_err!(Write))?;

            let mut offerings = txn.open_table(OFFERINGS).map_err(map_err!(Table))?;
            clear_prefix(&mut offerings, &prefix)?;
            for offering in &snapshot.offerings {
                let value = to_json(offering)?;
                offerings
                    .insert(child_key(session_id, offering.id).as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }

            let mut reservations = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
            clear_prefix(&mut reservations, &prefix)?;
            for reservation in &snapshot.reservations {
                let value = to_json(reservation)?;
                reservations
                    .insert(child_key(session_id, reservation.id).as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }

            let mut students = txn.open_table(STUDENTS).map_err(map_err!(Table))?;
            clear_prefix(&mut students, &prefix)?;
            for student in &snapshot.students {
                let value = to_json(student)?;
                students
                    .insert(child_key(session_id, student.id).as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            %session_id,
            offerings = snapshot.offerings.len(),
            reservations = snapshot.reservations.len(),
            students = snapshot.students.len(),
            "session snapshot stored"
        );
        Ok(())
    }

    /// Get a session header.
    pub fn get_session(&self, session_id: &str) -> StateResult<Option<SessionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        match table.get(session_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(from_json(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Delete a session and its child records. Returns true if it existed.
    pub fn delete_session(&self, session_id: &str) -> StateResult<bool> {
        let prefix = session_prefix(session_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            existed = sessions.remove(session_id).map_err(map_err!(Write))?.is_some();
            for def in [OFFERINGS, RESERVATIONS, STUDENTS] {
                let mut table = txn.open_table(def).map_err(map_err!(Table))?;
                clear_prefix(&mut table, &prefix)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%session_id, existed, "session deleted");
        Ok(existed)
    }

    // ── Students ───────────────────────────────────────────────────

    /// Get one student of a session.
    pub fn get_student(&self, session_id: &str, student_id: StudentId) -> StateResult<Option<StudentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STUDENTS).map_err(map_err!(Table))?;
        match table
            .get(child_key(session_id, student_id).as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => Ok(Some(from_json(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Insert or update one student of a session.
    pub fn put_student(&self, session_id: &str, student: &StudentRecord) -> StateResult<()> {
        check_session_id(session_id)?;
        let value = to_json(student)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STUDENTS).map_err(map_err!(Table))?;
            table
                .insert(child_key(session_id, student.id).as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

impl SessionStore for StateStore {
    fn load_session(&self, session_id: &str) -> StateResult<SessionSnapshot> {
        let prefix = session_prefix(session_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;

        let sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        let session: SessionRecord = match sessions.get(session_id).map_err(map_err!(Read))? {
            Some(guard) => from_json(guard.value())?,
            None => return Err(StateError::NotFound(format!("session {session_id}"))),
        };

        let offerings: Vec<OfferingRecord> = {
            let table = txn.open_table(OFFERINGS).map_err(map_err!(Table))?;
            scan_prefix(&table, &prefix)?
                .into_iter()
                .filter(|o: &OfferingRecord| !o.cancelled)
                .collect()
        };
        let reservations: Vec<ReservationRecord> = {
            let table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
            scan_prefix(&table, &prefix)?
        };
        let students: Vec<StudentRecord> = {
            let table = txn.open_table(STUDENTS).map_err(map_err!(Table))?;
            scan_prefix(&table, &prefix)?
        };

        debug!(
            %session_id,
            offerings = offerings.len(),
            students = students.len(),
            "session loaded"
        );
        Ok(SessionSnapshot {
            session,
            offerings,
            reservations,
            students,
        })
    }

    fn commit_enrollments(&self, session_id: &str, changes: &[EnrollmentChange]) -> StateResult<()> {
        check_session_id(session_id)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STUDENTS).map_err(map_err!(Table))?;
            for change in changes {
                let key = child_key(session_id, change.student_id);
                let stored = table
                    .get(key.as_str())
                    .map_err(map_err!(Read))?
                    .map(|guard| guard.value().to_vec());
                let Some(bytes) = stored else {
                    // Dropping the transaction without commit discards earlier changes.
                    return Err(StateError::NotFound(format!("student {}", change.student_id)));
                };
                let mut student: StudentRecord = from_json(&bytes)?;
                let request = student.course_request_mut(change.request_id).ok_or_else(|| {
                    StateError::NotFound(format!(
                        "request {} of student {}",
                        change.request_id, change.student_id
                    ))
                })?;
                request.enrollment = change.enrollment.clone();
                let value = to_json(&student)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%session_id, changes = changes.len(), "enrollments committed");
        Ok(())
    }

    fn list_sessions(&self) -> StateResult<Vec<SessionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(from_json(value.value())?);
        }
        Ok(results)
    }
}

fn to_json<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn scan_prefix<T, R>(table: &R, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push(from_json(value.value())?);
        }
    }
    Ok(results)
}

fn clear_prefix(table: &mut redb::Table<'_, &'static str, &'static [u8]>, prefix: &str) -> StateResult<()> {
    let keys: Vec<String> = table
        .iter()
        .map_err(map_err!(Read))?
        .filter_map(|entry| {
            let (key, _) = entry.ok()?;
            let k = key.value().to_string();
            k.starts_with(prefix).then_some(k)
        })
        .collect();
    for key in &keys {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            name: "Fall 2026".to_string(),
            begin_epoch_secs: 1_788_000_000,
            auto_start: true,
            updated_at: 1000,
        }
    }

    fn test_offering(id: OfferingId, cancelled: bool) -> OfferingRecord {
        OfferingRecord {
            id,
            courses: vec![CourseRecord {
                id: id * 10,
                name: format!("MATH {id}"),
                limit: None,
                deadlines: None,
            }],
            configs: vec![ConfigRecord {
                id: id * 100,
                name: "1".to_string(),
                limit: None,
                subparts: vec![SubpartRecord {
                    id: id * 1000,
                    name: "Lec".to_string(),
                    parent_id: None,
                    sections: vec![SectionRecord {
                        id: id * 10_000,
                        name: "1".to_string(),
                        parent_id: None,
                        time: Some(TimePattern::new(0b101, 120, 12)),
                        rooms: vec![],
                        instructors: vec![],
                        limit: Some(30),
                    }],
                }],
            }],
            cancelled,
        }
    }

    fn test_student(id: StudentId) -> StudentRecord {
        StudentRecord {
            id,
            external_id: format!("S{id}"),
            name: format!("Student {id}"),
            requests: vec![RequestRecord::Course(CourseRequestRecord {
                id: id * 10,
                priority: 0,
                alternative: false,
                waitlist: false,
                courses: vec![10],
                timestamp: Some(1000),
                enrollment: None,
                preferred_sections: vec![],
            })],
        }
    }

    fn test_snapshot(id: &str) -> SessionSnapshot {
        SessionSnapshot {
            session: test_session(id),
            offerings: vec![test_offering(1, false), test_offering(2, true)],
            reservations: vec![],
            students: vec![test_student(1), test_student(2)],
        }
    }

    fn enrollment(section: SectionId) -> EnrollmentRecord {
        EnrollmentRecord {
            offering_id: 1,
            course_id: 10,
            config_id: 100,
            section_ids: vec![section],
            reservation_id: None,
            approved: false,
            timestamp: 2000,
        }
    }

    #[test]
    fn snapshot_put_and_load_skips_cancelled_offerings() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&test_snapshot("fall")).unwrap();

        let loaded = store.load_session("fall").unwrap();
        assert_eq!(loaded.session, test_session("fall"));
        assert_eq!(loaded.offerings.len(), 1);
        assert_eq!(loaded.offerings[0].id, 1);
        assert_eq!(loaded.students.len(), 2);
    }

    #[test]
    fn load_missing_session_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.load_session("nope").unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn sessions_do_not_leak_into_each_other() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&test_snapshot("fall")).unwrap();
        let mut spring = test_snapshot("spring");
        spring.students.truncate(1);
        store.put_snapshot(&spring).unwrap();

        assert_eq!(store.load_session("fall").unwrap().students.len(), 2);
        assert_eq!(store.load_session("spring").unwrap().students.len(), 1);
        assert_eq!(store.list_sessions().unwrap().len(), 2);
    }

    #[test]
    fn session_id_with_separator_cannot_shadow_another_session() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&test_snapshot("a")).unwrap();

        let err = store.put_snapshot(&test_snapshot("a:b")).unwrap_err();
        assert!(matches!(err, StateError::InvalidKey(_)));
        let err = store.put_student("a:b", &test_student(9)).unwrap_err();
        assert!(matches!(err, StateError::InvalidKey(_)));

        assert_eq!(store.load_session("a").unwrap().students.len(), 2);
        assert!(matches!(store.load_session("a:b"), Err(StateError::NotFound(_))));
        assert_eq!(store.list_sessions().unwrap().len(), 1);
    }

    #[test]
    fn put_snapshot_replaces_previous_children() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&test_snapshot("fall")).unwrap();
        let mut smaller = test_snapshot("fall");
        smaller.students = vec![test_student(3)];
        store.put_snapshot(&smaller).unwrap();

        let loaded = store.load_session("fall").unwrap();
        assert_eq!(loaded.students.len(), 1);
        assert_eq!(loaded.students[0].id, 3);
    }

    #[test]
    fn commit_enrollments_updates_requests() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&test_snapshot("fall")).unwrap();

        store
            .commit_enrollments(
                "fall",
                &[EnrollmentChange {
                    student_id: 1,
                    request_id: 10,
                    enrollment: Some(enrollment(10_000)),
                }],
            )
            .unwrap();

        let student = store.get_student("fall", 1).unwrap().unwrap();
        let request = student.course_request(10).unwrap();
        assert_eq!(request.enrollment, Some(enrollment(10_000)));
    }

    #[test]
    fn failed_commit_applies_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&test_snapshot("fall")).unwrap();

        let result = store.commit_enrollments(
            "fall",
            &[
                EnrollmentChange {
                    student_id: 1,
                    request_id: 10,
                    enrollment: Some(enrollment(10_000)),
                },
                EnrollmentChange {
                    student_id: 99,
                    request_id: 990,
                    enrollment: None,
                },
            ],
        );
        assert!(matches!(result, Err(StateError::NotFound(_))));

        let student = store.get_student("fall", 1).unwrap().unwrap();
        assert!(student.course_request(10).unwrap().enrollment.is_none());
    }

    #[test]
    fn delete_session_removes_children() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&test_snapshot("fall")).unwrap();

        assert!(store.delete_session("fall").unwrap());
        assert!(!store.delete_session("fall").unwrap());
        assert!(store.get_student("fall", 1).unwrap().is_none());
        assert!(store.get_session("fall").unwrap().is_none());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_snapshot(&test_snapshot("fall")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let loaded = store.load_session("fall").unwrap();
        assert_eq!(loaded.session.name, "Fall 2026");
    }
}
