//! Resectioning of one request.
//!
//! ```text
//! Init ──► CandidatesEnumerated ──► Filtered ──► Scored ──► Decided
//!   │
//!   └──► Decided (unschedulable)
//! ```
//!
//! Each step may only run from the state before it. The selection reads
//! the catalog and never mutates it; applying the decision is the
//! scheduler's job.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use solvergrid_state::*;

use crate::catalog::Catalog;
use crate::deadline::{DeadlineRule, Deadlines};
use crate::distance::DistanceMetric;
use crate::error::{SectioningError, SectioningResult};
use crate::optimizer::{Candidate, Optimizer, ProblemSnapshot};
use crate::request::SectioningRequest;
use crate::reservation::{self, CapacityFailure};
use crate::weights::WeightFunction;

/// Weights closer than this are ties.
const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    Init,
    CandidatesEnumerated,
    Filtered,
    Scored,
    Decided,
}

/// Why a candidate was discarded, in the order the filters run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterReason {
    TimeConflict { request_id: RequestId },
    Deadline { section_id: SectionId, rule: DeadlineRule },
    Reservation,
    Capacity { section_id: Option<SectionId> },
}

impl FilterReason {
    fn stage(&self) -> u8 {
        match self {
            FilterReason::TimeConflict { .. } => 0,
            FilterReason::Deadline { .. } => 1,
            FilterReason::Reservation => 2,
            FilterReason::Capacity { .. } => 3,
        }
    }
}

/// Why nothing was chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnassignedReason {
    /// The student's timetable or the requested courses cannot be resolved.
    Unschedulable { detail: String },
    NoCandidates,
    /// Every candidate was filtered; the reason of the candidate that got
    /// furthest through the filters.
    Filtered { reason: FilterReason },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionDecision {
    Chosen { candidate: Candidate, weight: f64 },
    None(UnassignedReason),
}

/// Fixed inputs of a selection.
pub struct SelectionContext<'a> {
    pub optimizer: &'a dyn Optimizer,
    pub weights: &'a dyn WeightFunction,
    pub deadlines: Deadlines,
    pub distance: DistanceMetric,
    pub week: i32,
    pub override_deadline: bool,
}

pub struct ResectioningSelection<'a> {
    catalog: &'a Catalog,
    request: &'a SectioningRequest,
    context: SelectionContext<'a>,
    state: SelectionState,
    problem: Option<ProblemSnapshot<'a>>,
    candidates: Vec<Candidate>,
    rejected: Vec<FilterReason>,
    ranked: Vec<(Candidate, f64)>,
    decision: Option<SelectionDecision>,
}

impl<'a> ResectioningSelection<'a> {
    pub fn new(catalog: &'a Catalog, request: &'a SectioningRequest, context: SelectionContext<'a>) -> Self {
        Self {
            catalog,
            request,
            context,
            state: SelectionState::Init,
            problem: None,
            candidates: Vec::new(),
            rejected: Vec::new(),
            ranked: Vec::new(),
            decision: None,
        }
    }

    pub fn state(&self) -> SelectionState {
        self.state
    }

    /// Candidates enumerated, then surviving the filters.
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Reasons of every filtered candidate.
    pub fn rejected(&self) -> &[FilterReason] {
        &self.rejected
    }

    pub fn ranked(&self) -> &[(Candidate, f64)] {
        &self.ranked
    }

    pub fn decision(&self) -> Option<&SelectionDecision> {
        self.decision.as_ref()
    }

    fn expect_state(&self, expected: SelectionState, step: &str) -> SectioningResult<()> {
        if self.state != expected {
            return Err(SectioningError::InvalidTransition(format!(
                "{step} requires {expected:?}, selection is {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn abort(&mut self, reason: UnassignedReason) {
        trace!(student_id = self.request.student_id, request_id = self.request.request_id, ?reason, "selection aborted");
        self.decision = Some(SelectionDecision::None(reason));
        self.state = SelectionState::Decided;
    }

    /// Resolve candidate courses and the student's other commitments, then
    /// enumerate candidate enrollments.
    pub fn enumerate(&mut self) -> SectioningResult<()> {
        self.expect_state(SelectionState::Init, "enumerate")?;
        let student = self
            .catalog
            .student(self.request.student_id)
            .ok_or(SectioningError::UnknownStudent(self.request.student_id))?;

        let blocks = match self
            .catalog
            .other_assignments(student, self.request.request_id, self.request.priority)
        {
            Ok(blocks) => blocks,
            Err(request_id) => {
                self.abort(UnassignedReason::Unschedulable {
                    detail: format!("request {request_id} references an unknown section"),
                });
                return Ok(());
            }
        };
        let courses: Vec<(usize, CourseId)> = self
            .request
            .courses
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, c)| self.catalog.course(*c).is_some())
            .collect();
        if courses.is_empty() {
            self.abort(UnassignedReason::Unschedulable {
                detail: "no requested course is offered".to_string(),
            });
            return Ok(());
        }

        let problem = ProblemSnapshot {
            catalog: self.catalog,
            request: self.request,
            courses,
            blocks,
            distance: self.context.distance,
        };
        self.candidates = self.context.optimizer.enumerate(&problem);
        self.problem = Some(problem);
        self.state = SelectionState::CandidatesEnumerated;
        Ok(())
    }

    /// Drop candidates that clash, miss a deadline, are not eligible or do not fit.
    pub fn filter(&mut self) -> SectioningResult<()> {
        self.expect_state(SelectionState::CandidatesEnumerated, "filter")?;
        let Some(problem) = self.problem.as_ref() else {
            return Err(SectioningError::InvalidTransition("filter without a problem".to_string()));
        };
        let candidates = std::mem::take(&mut self.candidates);
        let mut kept = Vec::with_capacity(candidates.len());
        let mut rejected = Vec::new();
        for mut candidate in candidates {
            match self.check(problem, &candidate) {
                Ok(reservation_id) => {
                    candidate.reservation_id = reservation_id;
                    kept.push(candidate);
                }
                Err(reason) => rejected.push(reason),
            }
        }
        self.candidates = kept;
        self.rejected = rejected;
        self.state = SelectionState::Filtered;
        Ok(())
    }

    fn check(&self, problem: &ProblemSnapshot<'_>, candidate: &Candidate) -> Result<Option<ReservationId>, FilterReason> {
        let catalog = self.catalog;
        for section_id in &candidate.sections {
            let Some(time) = catalog.section(*section_id).and_then(|s| s.time) else {
                continue;
            };
            if let Some(block) = problem.blocks.iter().find(|b| b.hard && b.time.overlaps(&time)) {
                return Err(FilterReason::TimeConflict {
                    request_id: block.request_id,
                });
            }
        }

        if !self.context.override_deadline {
            if let Some((section_id, rule)) = self.context.deadlines.check_candidate(
                catalog,
                candidate.course_id,
                &candidate.sections,
                self.request.prior.as_ref(),
                self.context.week,
            ) {
                return Err(FilterReason::Deadline { section_id, rule });
            }
        }

        reservation::choose(
            catalog,
            self.request.student_id,
            candidate.course_id,
            candidate.config_id,
            &candidate.sections,
            self.request.prior.as_ref(),
        )
        .map_err(|failure| match failure {
            CapacityFailure::Ineligible => FilterReason::Reservation,
            CapacityFailure::Full { section_id } => FilterReason::Capacity { section_id },
        })
    }

    /// Weigh the surviving candidates.
    pub fn score(&mut self) -> SectioningResult<()> {
        self.expect_state(SelectionState::Filtered, "score")?;
        let Some(problem) = self.problem.as_ref() else {
            return Err(SectioningError::InvalidTransition("score without a problem".to_string()));
        };
        let candidates = std::mem::take(&mut self.candidates);
        self.ranked = self.context.optimizer.rank(problem, candidates, self.context.weights);
        self.state = SelectionState::Scored;
        Ok(())
    }

    /// Pick the best candidate, breaking ties with `rng`.
    pub fn decide<R: Rng + ?Sized>(&mut self, rng: &mut R) -> SectioningResult<&SelectionDecision> {
        self.expect_state(SelectionState::Scored, "decide")?;
        let decision = match self.ranked.first() {
            None => SelectionDecision::None(self.empty_reason()),
            Some((_, best)) => {
                let best = *best;
                let ties = self
                    .ranked
                    .iter()
                    .take_while(|(_, w)| best - *w <= TIE_EPSILON)
                    .count();
                let (candidate, weight) = self.ranked[rng.gen_range(0..ties)].clone();
                SelectionDecision::Chosen { candidate, weight }
            }
        };
        self.state = SelectionState::Decided;
        Ok(self.decision.insert(decision))
    }

    fn empty_reason(&self) -> UnassignedReason {
        let furthest = self.rejected.iter().fold(None::<&FilterReason>, |best, r| match best {
            Some(b) if b.stage() >= r.stage() => Some(b),
            _ => Some(r),
        });
        match furthest {
            Some(reason) => UnassignedReason::Filtered { reason: *reason },
            None => UnassignedReason::NoCandidates,
        }
    }

    /// Run every remaining step.
    pub fn run<R: Rng + ?Sized>(&mut self, rng: &mut R) -> SectioningResult<SelectionDecision> {
        if self.state == SelectionState::Init {
            self.enumerate()?;
        }
        if self.state == SelectionState::CandidatesEnumerated {
            self.filter()?;
        }
        if self.state == SelectionState::Filtered {
            self.score()?;
        }
        if self.state == SelectionState::Scored {
            self.decide(rng)?;
        }
        self.decision
            .clone()
            .ok_or_else(|| SectioningError::InvalidTransition("selection ended undecided".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::catalog::fixtures::*;
    use crate::optimizer::ExhaustiveOptimizer;
    use crate::request::SectioningAction;
    use crate::weights::DefaultWeights;

    const OPTIMIZER: ExhaustiveOptimizer = ExhaustiveOptimizer { max_candidates: 100 };

    fn context<'a>(weights: &'a DefaultWeights, week: i32) -> SelectionContext<'a> {
        SelectionContext {
            optimizer: &OPTIMIZER,
            weights,
            deadlines: Deadlines::new(DeadlineWeeks {
                enroll: 2,
                change: 1,
                drop: 4,
            }),
            distance: DistanceMetric {
                limit_meters: 670.0,
                break_slots: 2,
            },
            week,
            override_deadline: false,
        }
    }

    fn catalog(requests: Vec<RequestRecord>) -> Catalog {
        Catalog::from_snapshot(snapshot(
            vec![
                offering(1, vec![section(11, MON_WED, TEN_AM, Some(1)), section(12, TUE_THU, TEN_AM, Some(5))]),
                offering(2, vec![section(21, MON_WED, TEN_AM, Some(5))]),
            ],
            vec![student(7, requests)],
        ))
    }

    fn run(catalog: &Catalog, week: i32) -> (SelectionDecision, Vec<FilterReason>) {
        let request = SectioningRequest::build(catalog, 7, 1, SectioningAction::Enroll, "test").unwrap();
        let weights = DefaultWeights::default();
        let mut selection = ResectioningSelection::new(catalog, &request, context(&weights, week));
        let decision = selection.run(&mut StdRng::seed_from_u64(1)).unwrap();
        (decision, selection.rejected().to_vec())
    }

    fn chosen_sections(decision: &SelectionDecision) -> Vec<SectionId> {
        match decision {
            SelectionDecision::Chosen { candidate, .. } => candidate.sections.clone(),
            SelectionDecision::None(reason) => panic!("nothing chosen: {reason:?}"),
        }
    }

    #[test]
    fn steps_out_of_order_are_rejected() {
        let catalog = catalog(vec![RequestRecord::Course(course_request(1, vec![10]))]);
        let request = SectioningRequest::build(&catalog, 7, 1, SectioningAction::Enroll, "test").unwrap();
        let weights = DefaultWeights::default();
        let mut selection = ResectioningSelection::new(&catalog, &request, context(&weights, 0));

        assert!(matches!(selection.filter(), Err(SectioningError::InvalidTransition(_))));
        selection.enumerate().unwrap();
        assert_eq!(selection.state(), SelectionState::CandidatesEnumerated);
        assert_eq!(selection.candidates().len(), 2);
        assert!(selection.score().is_err());
        selection.filter().unwrap();
        selection.score().unwrap();
        assert_eq!(selection.ranked().len(), 2);
        selection.decide(&mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(selection.state(), SelectionState::Decided);
        assert!(selection.decision().is_some());
    }

    #[test]
    fn committed_enrollment_blocks_overlapping_sections() {
        let mut other = course_request(2, vec![20]);
        other.enrollment = Some(enrollment(2, vec![21]));
        let catalog = catalog(vec![
            RequestRecord::Course(course_request(1, vec![10])),
            RequestRecord::Course(other),
        ]);
        let (decision, rejected) = run(&catalog, 0);
        assert_eq!(chosen_sections(&decision), vec![12]);
        assert_eq!(rejected, vec![FilterReason::TimeConflict { request_id: 2 }]);
    }

    #[test]
    fn more_important_free_time_is_hard() {
        let ft = RequestRecord::FreeTime(FreeTimeRequestRecord {
            id: 5,
            priority: 0,
            time: TimePattern::new(TUE_THU, TEN_AM, 12),
        });
        let mut cr = course_request(1, vec![10]);
        cr.priority = 1;
        let catalog = catalog(vec![ft, RequestRecord::Course(cr)]);
        let (decision, _) = run(&catalog, 0);
        assert_eq!(chosen_sections(&decision), vec![11]);
    }

    #[test]
    fn everything_past_deadline_reports_deadline() {
        let catalog = catalog(vec![RequestRecord::Course(course_request(1, vec![10]))]);
        let (decision, _) = run(&catalog, 5);
        assert_eq!(
            decision,
            SelectionDecision::None(UnassignedReason::Filtered {
                reason: FilterReason::Deadline {
                    section_id: 11,
                    rule: DeadlineRule::New
                }
            })
        );
    }

    #[test]
    fn full_sections_report_capacity() {
        let catalog = Catalog::from_snapshot(snapshot(
            vec![offering(1, vec![section(11, MON_WED, TEN_AM, Some(0))])],
            vec![student(7, vec![RequestRecord::Course(course_request(1, vec![10]))])],
        ));
        let (decision, _) = run(&catalog, 0);
        assert_eq!(
            decision,
            SelectionDecision::None(UnassignedReason::Filtered {
                reason: FilterReason::Capacity { section_id: Some(11) }
            })
        );
    }

    #[test]
    fn unknown_courses_are_unschedulable() {
        let catalog = catalog(vec![RequestRecord::Course(course_request(1, vec![990]))]);
        let (decision, _) = run(&catalog, 0);
        assert!(matches!(
            decision,
            SelectionDecision::None(UnassignedReason::Unschedulable { .. })
        ));
    }

    #[test]
    fn same_seed_same_choice() {
        let catalog = catalog(vec![RequestRecord::Course(course_request(1, vec![10]))]);
        let (a, _) = run(&catalog, 0);
        let (b, _) = run(&catalog, 0);
        assert_eq!(a, b);
    }
}
