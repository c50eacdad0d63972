//! Held and expected space.
//!
//! Held space counts committed enrollments and is the only input to the
//! hard capacity check. Expected space is a soft demand estimate: every
//! unassigned request spreads one seat evenly over the enrollments of its
//! course that would still fit the student's timetable.

use tracing::trace;

use solvergrid_state::*;

use crate::catalog::Catalog;

#[derive(Debug, Clone, Copy)]
pub struct SpaceAccountant {
    /// Upper bound on enrollments enumerated per course when spreading.
    pub max_enrollments: usize,
}

impl Default for SpaceAccountant {
    fn default() -> Self {
        Self { max_enrollments: 1024 }
    }
}

impl SpaceAccountant {
    /// Commit an enrollment: held += 1 on each touched counter, and the
    /// request no longer contributes expected space.
    pub fn assign(&self, catalog: &mut Catalog, student_id: StudentId, request_id: RequestId, enrollment: &EnrollmentRecord) {
        catalog.adjust_held(enrollment, 1);
        withdraw(catalog, student_id, request_id);
    }

    /// Release an enrollment and spread the request's demand over its
    /// remaining feasible alternatives.
    pub fn unassign(
        &self,
        catalog: &mut Catalog,
        student_id: StudentId,
        request_id: RequestId,
        enrollment: &EnrollmentRecord,
    ) {
        catalog.adjust_held(enrollment, -1);
        self.spread(catalog, student_id, request_id, enrollment.course_id);
    }

    /// Rebuild expected space from scratch from every unassigned request's
    /// primary course.
    pub fn recompute_expected(&self, catalog: &mut Catalog) {
        for section in catalog.sections_mut() {
            section.expected = 0.0;
        }
        catalog.expected_credits.clear();

        let pending: Vec<(StudentId, RequestId, CourseId)> = catalog
            .students()
            .flat_map(|s| {
                s.requests.iter().filter_map(move |r| match r {
                    RequestRecord::Course(cr) if cr.enrollment.is_none() => {
                        cr.courses.first().map(|c| (s.id, cr.id, *c))
                    }
                    _ => None,
                })
            })
            .collect();
        for (student_id, request_id, course_id) in pending {
            self.spread(catalog, student_id, request_id, course_id);
        }
    }

    fn spread(&self, catalog: &mut Catalog, student_id: StudentId, request_id: RequestId, course_id: CourseId) {
        withdraw(catalog, student_id, request_id);
        let credits = self.credits(catalog, student_id, request_id, course_id);
        if credits.is_empty() {
            return;
        }
        for (section_id, share) in &credits {
            if let Some(section) = catalog.section_mut(*section_id) {
                section.expected += share;
            }
        }
        trace!(student_id, request_id, course_id, sections = credits.len(), "spread expected space");
        catalog.expected_credits.insert((student_id, request_id), credits);
    }

    fn credits(&self, catalog: &Catalog, student_id: StudentId, request_id: RequestId, course_id: CourseId) -> Vec<(SectionId, f64)> {
        let Some(student) = catalog.student(student_id) else {
            return Vec::new();
        };
        let priority = student.course_request(request_id).map(|r| r.priority).unwrap_or(0);
        let Ok(blocks) = catalog.other_assignments(student, request_id, priority) else {
            return Vec::new();
        };

        let feasible: Vec<Vec<SectionId>> = catalog
            .enumerate_enrollments(course_id, self.max_enrollments)
            .into_iter()
            .map(|(_, sections)| sections)
            .filter(|sections| {
                sections.iter().filter_map(|s| catalog.section(*s)).all(|section| {
                    section.time.is_none_or(|t| !blocks.iter().any(|b| b.hard && b.time.overlaps(&t)))
                })
            })
            .collect();
        if feasible.is_empty() {
            return Vec::new();
        }

        let share = 1.0 / feasible.len() as f64;
        let mut credits: Vec<(SectionId, f64)> = Vec::new();
        for section_id in feasible.into_iter().flatten() {
            match credits.iter_mut().find(|(id, _)| *id == section_id) {
                Some((_, total)) => *total += share,
                None => credits.push((section_id, share)),
            }
        }
        credits
    }
}

/// Remove whatever expected space `request_id` contributed.
fn withdraw(catalog: &mut Catalog, student_id: StudentId, request_id: RequestId) {
    let Some(credits) = catalog.expected_credits.remove(&(student_id, request_id)) else {
        return;
    };
    for (section_id, share) in credits {
        if let Some(section) = catalog.section_mut(section_id) {
            section.expected = (section.expected - share).max(0.0);
        }
    }
}
