//! Persisted records of an academic session.
//!
//! These types describe the catalog as the persistence layer hands it to
//! the scheduler: offerings with their configs, subparts and sections,
//! reservations, and students with their requests. All types serialize
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

use solvergrid_core::SessionId;

pub type OfferingId = u64;
pub type CourseId = u64;
pub type ConfigId = u64;
pub type SubpartId = u64;
pub type SectionId = u64;
pub type StudentId = u64;
pub type RequestId = u64;
pub type ReservationId = u64;
pub type RoomId = u64;

/// Number of 5-minute slots in a day.
pub const SLOTS_PER_DAY: u16 = 288;

// ── Session ────────────────────────────────────────────────────────

/// Session header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    /// Unix timestamp (seconds) of the first day of week 0.
    pub begin_epoch_secs: u64,
    /// Whether the coordinator keeps an online-sectioning solver loaded.
    pub auto_start: bool,
    pub updated_at: u64,
}

/// Everything the scheduler needs to bootstrap one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub session: SessionRecord,
    pub offerings: Vec<OfferingRecord>,
    pub reservations: Vec<ReservationRecord>,
    pub students: Vec<StudentRecord>,
}

// ── Time & rooms ───────────────────────────────────────────────────

/// A weekly meeting pattern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TimePattern {
    /// Bit 0 = Monday … bit 6 = Sunday.
    pub days: u8,
    /// First 5-minute slot of the day.
    pub start_slot: u16,
    /// Length in 5-minute slots.
    pub length: u16,
    /// Bit i = the pattern meets in week i of the session.
    pub weeks: u64,
}

impl TimePattern {
    pub fn new(days: u8, start_slot: u16, length: u16) -> Self {
        Self {
            days,
            start_slot,
            length,
            weeks: u64::MAX,
        }
    }

    pub fn end_slot(&self) -> u16 {
        self.start_slot + self.length
    }

    pub fn shares_days(&self, other: &TimePattern) -> bool {
        self.days & other.days != 0 && self.weeks & other.weeks != 0
    }

    /// Two patterns overlap when they meet on a common day and week and
    /// their slot ranges intersect.
    pub fn overlaps(&self, other: &TimePattern) -> bool {
        self.shares_days(other)
            && self.start_slot < other.end_slot()
            && other.start_slot < self.end_slot()
    }

    /// First week the pattern meets, if any.
    pub fn first_week(&self) -> Option<u32> {
        (self.weeks != 0).then(|| self.weeks.trailing_zeros())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: String,
    /// Map coordinates in meters, when known.
    pub x: Option<f64>,
    pub y: Option<f64>,
}

// ── Offerings ──────────────────────────────────────────────────────

/// Per-course enrollment deadlines, in weeks relative to a section's first week.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadlineWeeks {
    pub enroll: i32,
    pub change: i32,
    pub drop: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferingRecord {
    pub id: OfferingId,
    pub courses: Vec<CourseRecord>,
    pub configs: Vec<ConfigRecord>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourseRecord {
    pub id: CourseId,
    /// Display name, e.g. `MATH 101`.
    pub name: String,
    pub limit: Option<u32>,
    /// Overrides the session-wide deadlines.
    pub deadlines: Option<DeadlineWeeks>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigRecord {
    pub id: ConfigId,
    pub name: String,
    pub limit: Option<u32>,
    pub subparts: Vec<SubpartRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubpartRecord {
    pub id: SubpartId,
    /// Instructional type, e.g. `Lec`, `Rec`, `Lab`.
    pub name: String,
    pub parent_id: Option<SubpartId>,
    pub sections: Vec<SectionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionRecord {
    pub id: SectionId,
    pub name: String,
    pub parent_id: Option<SectionId>,
    /// `None` for arrange-hours sections.
    pub time: Option<TimePattern>,
    pub rooms: Vec<RoomRecord>,
    pub instructors: Vec<String>,
    /// `None` for unlimited.
    pub limit: Option<u32>,
}

// ── Reservations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReservationScope {
    /// Listed students, one by one.
    Individual { students: Vec<StudentId> },
    /// Members of a named student group.
    Group { name: String, students: Vec<StudentId> },
    /// Every student requesting the given course.
    Course { course_id: CourseId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReservationRecord {
    pub id: ReservationId,
    pub offering_id: OfferingId,
    pub scope: ReservationScope,
    /// `None` for unlimited.
    pub limit: Option<u32>,
    pub must_be_used: bool,
    pub can_assign_over_limit: bool,
    pub expired: bool,
    /// Restrict to these configs (empty = any).
    pub config_ids: Vec<ConfigId>,
    /// Restrict to these sections (empty = any).
    pub section_ids: Vec<SectionId>,
}

// ── Students ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudentRecord {
    pub id: StudentId,
    pub external_id: String,
    pub name: String,
    pub requests: Vec<RequestRecord>,
}

impl StudentRecord {
    pub fn course_request(&self, request_id: RequestId) -> Option<&CourseRequestRecord> {
        self.requests.iter().find_map(|r| match r {
            RequestRecord::Course(cr) if cr.id == request_id => Some(cr),
            _ => None,
        })
    }

    pub fn course_request_mut(&mut self, request_id: RequestId) -> Option<&mut CourseRequestRecord> {
        self.requests.iter_mut().find_map(|r| match r {
            RequestRecord::Course(cr) if cr.id == request_id => Some(cr),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestRecord {
    FreeTime(FreeTimeRequestRecord),
    Course(CourseRequestRecord),
}

impl RequestRecord {
    pub fn id(&self) -> RequestId {
        match self {
            RequestRecord::FreeTime(ft) => ft.id,
            RequestRecord::Course(cr) => cr.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FreeTimeRequestRecord {
    pub id: RequestId,
    pub priority: u32,
    pub time: TimePattern,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourseRequestRecord {
    pub id: RequestId,
    pub priority: u32,
    pub alternative: bool,
    pub waitlist: bool,
    /// Primary course first, then alternates in preference order.
    pub courses: Vec<CourseId>,
    /// Unix timestamp (seconds) the request was submitted.
    pub timestamp: Option<u64>,
    pub enrollment: Option<EnrollmentRecord>,
    /// The student's last known section choice.
    pub preferred_sections: Vec<SectionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrollmentRecord {
    pub offering_id: OfferingId,
    pub course_id: CourseId,
    pub config_id: ConfigId,
    pub section_ids: Vec<SectionId>,
    pub reservation_id: Option<ReservationId>,
    pub approved: bool,
    pub timestamp: u64,
}

/// One enrollment write-back: `None` clears the request's enrollment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrollmentChange {
    pub student_id: StudentId,
    pub request_id: RequestId,
    pub enrollment: Option<EnrollmentRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MON_WED: u8 = 0b0000_0101;
    const TUE_THU: u8 = 0b0000_1010;

    #[test]
    fn same_slot_same_day_overlaps() {
        let a = TimePattern::new(MON_WED, 120, 12);
        let b = TimePattern::new(MON_WED, 126, 12);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn adjacent_slots_do_not_overlap() {
        let a = TimePattern::new(MON_WED, 120, 12);
        let b = TimePattern::new(MON_WED, 132, 12);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn different_days_do_not_overlap() {
        let a = TimePattern::new(MON_WED, 120, 12);
        let b = TimePattern::new(TUE_THU, 120, 12);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn disjoint_weeks_do_not_overlap() {
        let mut a = TimePattern::new(MON_WED, 120, 12);
        let mut b = a;
        a.weeks = 0b0011;
        b.weeks = 0b1100;
        assert!(!a.overlaps(&b));
        assert_eq!(b.first_week(), Some(2));
    }

    #[test]
    fn request_record_tags_by_type() {
        let req = RequestRecord::FreeTime(FreeTimeRequestRecord {
            id: 7,
            priority: 0,
            time: TimePattern::new(MON_WED, 0, 12),
        });
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"free_time\""));
        assert_eq!(req.id(), 7);
    }
}
