//! Sectioning requests and the order in which a batch is attempted.
//!
//! The order protects students who are already enrolled or hold an
//! individual reservation. It only decides the attempt sequence; every
//! request is still checked for conflicts on its own.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use solvergrid_state::*;

use crate::catalog::Catalog;
use crate::error::{SectioningError, SectioningResult};
use crate::reservation;

/// What the student asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectioningAction {
    Enroll,
    Change,
    Drop,
}

impl SectioningAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectioningAction::Enroll => "enroll",
            SectioningAction::Change => "change",
            SectioningAction::Drop => "drop",
        }
    }
}

/// One pending course request, wrapped for a single scheduling attempt.
///
/// Equality follows the batch order: two requests are equal when neither
/// goes first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectioningRequest {
    pub student_id: StudentId,
    pub request_id: RequestId,
    pub courses: Vec<CourseId>,
    pub priority: u32,
    pub alternative: bool,
    pub waitlist: bool,
    pub timestamp: Option<u64>,
    pub prior: Option<EnrollmentRecord>,
    pub preferred_sections: Vec<SectionId>,
    pub individual_reservation: bool,
    pub action: SectioningAction,
    /// Who asked, for the audit trail.
    pub requester: String,
}

impl SectioningRequest {
    /// Wrap the stored course request of a student.
    pub fn build(
        catalog: &Catalog,
        student_id: StudentId,
        request_id: RequestId,
        action: SectioningAction,
        requester: impl Into<String>,
    ) -> SectioningResult<Self> {
        let student = catalog
            .student(student_id)
            .ok_or(SectioningError::UnknownStudent(student_id))?;
        let request = student
            .course_request(request_id)
            .ok_or(SectioningError::UnknownRequest {
                student_id,
                request_id,
            })?;
        Ok(Self {
            student_id,
            request_id,
            courses: request.courses.clone(),
            priority: request.priority,
            alternative: request.alternative,
            waitlist: request.waitlist,
            timestamp: request.timestamp,
            prior: request.enrollment.clone(),
            preferred_sections: request.preferred_sections.clone(),
            individual_reservation: reservation::has_individual(catalog, student_id, &request.courses),
            action,
            requester: requester.into(),
        })
    }

    /// Sections the student last chose: the preferred list, else the prior enrollment.
    pub fn reference_sections(&self) -> &[SectionId] {
        if !self.preferred_sections.is_empty() {
            return &self.preferred_sections;
        }
        self.prior
            .as_ref()
            .map(|e| e.section_ids.as_slice())
            .unwrap_or(&[])
    }
}

/// Earlier timestamp first, missing timestamp last.
fn by_timestamp(a: Option<u64>, b: Option<u64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl Ord for SectioningRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        let (mine, theirs) = (self.prior.is_some(), other.prior.is_some());
        if mine != theirs {
            return if mine { Ordering::Less } else { Ordering::Greater };
        }
        if self.individual_reservation != other.individual_reservation {
            return if self.individual_reservation {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
        if !mine {
            let cmp = by_timestamp(self.timestamp, other.timestamp);
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        if self.alternative != other.alternative {
            return if self.alternative {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }
        let cmp = self.priority.cmp(&other.priority);
        if cmp != Ordering::Equal {
            return cmp;
        }
        if mine {
            let cmp = by_timestamp(self.timestamp, other.timestamp);
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        self.student_id
            .cmp(&other.student_id)
            .then(self.request_id.cmp(&other.request_id))
    }
}

impl PartialOrd for SectioningRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SectioningRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SectioningRequest {}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::catalog::fixtures::enrollment;

    fn request(student_id: StudentId) -> SectioningRequest {
        SectioningRequest {
            student_id,
            request_id: student_id * 10,
            courses: vec![10],
            priority: 0,
            alternative: false,
            waitlist: false,
            timestamp: Some(100),
            prior: None,
            preferred_sections: vec![],
            individual_reservation: false,
            action: SectioningAction::Enroll,
            requester: "test".to_string(),
        }
    }

    #[test]
    fn prior_enrollment_sorts_first() {
        let mut enrolled = request(2);
        enrolled.prior = Some(enrollment(1, vec![11]));
        enrolled.timestamp = Some(999);
        assert!(enrolled < request(1));
    }

    #[test]
    fn individual_reservation_sorts_before_timestamp() {
        let mut reserved = request(2);
        reserved.individual_reservation = true;
        reserved.timestamp = Some(999);
        assert!(reserved < request(1));
    }

    #[test]
    fn missing_timestamp_sorts_last() {
        let mut late = request(1);
        late.timestamp = None;
        let mut on_time = request(2);
        on_time.timestamp = Some(5_000);
        assert!(on_time < late);
    }

    #[test]
    fn alternative_then_priority() {
        let mut alt = request(1);
        alt.alternative = true;
        let mut low = request(2);
        low.priority = 3;
        assert!(low < alt);

        let mut high = request(3);
        high.priority = 1;
        assert!(high < low);
    }

    #[test]
    fn enrolled_timestamps_compare_after_priority() {
        let mut a = request(1);
        a.prior = Some(enrollment(1, vec![11]));
        a.timestamp = Some(50);
        a.priority = 2;
        let mut b = request(2);
        b.prior = Some(enrollment(1, vec![11]));
        b.timestamp = Some(500);
        b.priority = 1;
        // Priority wins over the re-request timestamp when both are enrolled.
        assert!(b < a);

        b.priority = 2;
        assert!(a < b);
    }

    #[test]
    fn student_id_breaks_remaining_ties() {
        assert!(request(1) < request(2));
        assert_eq!(request(3).cmp(&request(3)), Ordering::Equal);
    }

    #[test]
    fn equality_agrees_with_order() {
        let mut a = request(3);
        a.courses = vec![10, 20];
        a.preferred_sections = vec![11];
        a.requester = "registrar".to_string();
        let mut b = request(3);
        b.action = SectioningAction::Change;
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a, b);

        b.priority = 1;
        assert_ne!(a, b);
    }

    fn arb_request() -> impl Strategy<Value = SectioningRequest> {
        (
            0u64..6,
            0u64..3,
            proptest::option::of(0u64..4),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            0u32..3,
        )
            .prop_map(|(student, req, ts, enrolled, individual, alternative, priority)| {
                let mut r = request(student);
                r.request_id = req;
                r.timestamp = ts;
                r.prior = enrolled.then(|| enrollment(1, vec![11]));
                r.individual_reservation = individual;
                r.alternative = alternative;
                r.priority = priority;
                r
            })
    }

    proptest! {
        #[test]
        fn comparator_is_antisymmetric(a in arb_request(), b in arb_request()) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        }

        #[test]
        fn comparator_is_transitive(a in arb_request(), b in arb_request(), c in arb_request()) {
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
        }

        #[test]
        fn sorting_is_reproducible(mut batch in proptest::collection::vec(arb_request(), 0..30)) {
            let mut shuffled = batch.clone();
            shuffled.reverse();
            batch.sort();
            shuffled.sort();
            prop_assert_eq!(batch, shuffled);
        }
    }
}
