//! Optimizer boundary.
//!
//! The optimizer turns a problem snapshot into structurally valid candidate
//! enrollments and ranks them with a weight function. How it searches is
//! its own business; `ExhaustiveOptimizer` simply enumerates everything.

use serde::{Deserialize, Serialize};

use solvergrid_state::*;

use crate::catalog::{AssignedBlock, Catalog};
use crate::distance::DistanceMetric;
use crate::request::SectioningRequest;
use crate::weights::WeightFunction;

/// Read-only view of one request against the catalog.
pub struct ProblemSnapshot<'a> {
    pub catalog: &'a Catalog,
    pub request: &'a SectioningRequest,
    /// Candidate courses present in the catalog, primary first, with their
    /// position in the student's preference list.
    pub courses: Vec<(usize, CourseId)>,
    /// The student's other committed time blocks.
    pub blocks: Vec<AssignedBlock>,
    pub distance: DistanceMetric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub course_id: CourseId,
    pub offering_id: OfferingId,
    pub config_id: ConfigId,
    pub sections: Vec<SectionId>,
    /// Position of the course in the student's preference list.
    pub course_index: usize,
    /// Reservation the candidate would be enrolled under, once filtered.
    pub reservation_id: Option<ReservationId>,
}

impl Candidate {
    /// Same placement as an existing enrollment.
    pub fn matches(&self, enrollment: &EnrollmentRecord) -> bool {
        if self.course_id != enrollment.course_id || self.config_id != enrollment.config_id {
            return false;
        }
        let mut mine = self.sections.clone();
        let mut theirs = enrollment.section_ids.clone();
        mine.sort_unstable();
        theirs.sort_unstable();
        mine == theirs
    }
}

pub trait Optimizer: Send + Sync {
    /// All candidate enrollments of the problem.
    fn enumerate(&self, problem: &ProblemSnapshot<'_>) -> Vec<Candidate>;

    /// Candidates with their weights, best first. Equal weights keep the
    /// enumeration order.
    fn rank(
        &self,
        problem: &ProblemSnapshot<'_>,
        candidates: Vec<Candidate>,
        weights: &dyn WeightFunction,
    ) -> Vec<(Candidate, f64)> {
        let mut ranked: Vec<(Candidate, f64)> = candidates
            .into_iter()
            .map(|c| {
                let w = weights.weight(problem, &c);
                (c, w)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExhaustiveOptimizer {
    /// Enumeration stops after this many candidates over all courses.
    pub max_candidates: usize,
}

impl Default for ExhaustiveOptimizer {
    fn default() -> Self {
        Self { max_candidates: 10_000 }
    }
}

impl Optimizer for ExhaustiveOptimizer {
    fn enumerate(&self, problem: &ProblemSnapshot<'_>) -> Vec<Candidate> {
        let mut out = Vec::new();
        for (course_index, course_id) in &problem.courses {
            let Some(course) = problem.catalog.course(*course_id) else {
                continue;
            };
            let budget = self.max_candidates.saturating_sub(out.len());
            if budget == 0 {
                break;
            }
            out.extend(
                problem
                    .catalog
                    .enumerate_enrollments(*course_id, budget)
                    .into_iter()
                    .map(|(config_id, sections)| Candidate {
                        course_id: *course_id,
                        offering_id: course.offering_id,
                        config_id,
                        sections,
                        course_index: *course_index,
                        reservation_id: None,
                    }),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::*;
    use crate::request::SectioningAction;

    struct ByLowestSection;

    impl WeightFunction for ByLowestSection {
        fn weight(&self, _: &ProblemSnapshot<'_>, candidate: &Candidate) -> f64 {
            -(candidate.sections[0] as f64)
        }
    }

    fn problem_parts() -> (Catalog, SectioningRequest) {
        let record = student(7, vec![RequestRecord::Course(course_request(1, vec![20, 10]))]);
        let catalog = Catalog::from_snapshot(snapshot(
            vec![
                offering(1, vec![section(11, MON_WED, TEN_AM, None), section(12, TUE_THU, TEN_AM, None)]),
                offering(2, vec![section(21, MON_WED, TEN_AM, None)]),
            ],
            vec![record],
        ));
        let request = SectioningRequest::build(&catalog, 7, 1, SectioningAction::Enroll, "test").unwrap();
        (catalog, request)
    }

    fn problem<'a>(catalog: &'a Catalog, request: &'a SectioningRequest) -> ProblemSnapshot<'a> {
        ProblemSnapshot {
            catalog,
            request,
            courses: vec![(0, 20), (1, 10)],
            blocks: vec![],
            distance: DistanceMetric {
                limit_meters: 670.0,
                break_slots: 2,
            },
        }
    }

    #[test]
    fn enumerates_every_course_in_preference_order() {
        let (catalog, request) = problem_parts();
        let candidates = ExhaustiveOptimizer::default().enumerate(&problem(&catalog, &request));
        let summary: Vec<(CourseId, usize, Vec<SectionId>)> = candidates
            .iter()
            .map(|c| (c.course_id, c.course_index, c.sections.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![(20, 0, vec![21]), (10, 1, vec![11]), (10, 1, vec![12])]
        );
    }

    #[test]
    fn candidate_cap_is_global() {
        let (catalog, request) = problem_parts();
        let optimizer = ExhaustiveOptimizer { max_candidates: 2 };
        assert_eq!(optimizer.enumerate(&problem(&catalog, &request)).len(), 2);
    }

    #[test]
    fn ranking_sorts_best_first() {
        let (catalog, request) = problem_parts();
        let problem = problem(&catalog, &request);
        let optimizer = ExhaustiveOptimizer::default();
        let ranked = optimizer.rank(&problem, optimizer.enumerate(&problem), &ByLowestSection);
        let order: Vec<SectionId> = ranked.iter().map(|(c, _)| c.sections[0]).collect();
        assert_eq!(order, vec![11, 12, 21]);
    }

    #[test]
    fn candidate_matches_enrollment_regardless_of_order() {
        let candidate = Candidate {
            course_id: 10,
            offering_id: 1,
            config_id: 100,
            sections: vec![12, 11],
            course_index: 0,
            reservation_id: None,
        };
        assert!(candidate.matches(&enrollment(1, vec![11, 12])));
        assert!(!candidate.matches(&enrollment(1, vec![11])));
    }
}
