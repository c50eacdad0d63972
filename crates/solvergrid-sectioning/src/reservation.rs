//! Reservation eligibility and the capacity check.
//!
//! Reservations are only read here. Individual reservations take precedence
//! over group reservations, which take precedence over course reservations.

use solvergrid_state::*;

use crate::catalog::{Catalog, Reservation};

fn scope_rank(scope: &ReservationScope) -> u8 {
    match scope {
        ReservationScope::Individual { .. } => 0,
        ReservationScope::Group { .. } => 1,
        ReservationScope::Course { .. } => 2,
    }
}

/// Non-expired reservations covering `student_id` for `course_id`, in priority order.
pub fn applicable(catalog: &Catalog, student_id: StudentId, course_id: CourseId) -> Vec<&Reservation> {
    let Some(course) = catalog.course(course_id) else {
        return Vec::new();
    };
    let mut found: Vec<&Reservation> = catalog
        .reservations()
        .filter(|r| !r.record.expired && r.record.offering_id == course.offering_id)
        .filter(|r| match &r.record.scope {
            ReservationScope::Individual { students } | ReservationScope::Group { students, .. } => {
                students.contains(&student_id)
            }
            ReservationScope::Course { course_id: id } => *id == course_id,
        })
        .collect();
    found.sort_by_key(|r| (scope_rank(&r.record.scope), r.id()));
    found
}

/// Whether the student holds an individual reservation for any of the courses.
pub fn has_individual(catalog: &Catalog, student_id: StudentId, courses: &[CourseId]) -> bool {
    courses.iter().any(|course_id| {
        applicable(catalog, student_id, *course_id)
            .iter()
            .any(|r| matches!(r.record.scope, ReservationScope::Individual { .. }))
    })
}

/// Whether an enrollment falls inside the reservation's config and section
/// restrictions. A section restriction only binds the subparts it names.
pub fn covers(catalog: &Catalog, reservation: &Reservation, config_id: ConfigId, sections: &[SectionId]) -> bool {
    let record = &reservation.record;
    if !record.config_ids.is_empty() && !record.config_ids.contains(&config_id) {
        return false;
    }
    if record.section_ids.is_empty() {
        return true;
    }
    sections.iter().all(|section_id| {
        let Some(section) = catalog.section(*section_id) else {
            return false;
        };
        let restricted_subpart = record.section_ids.iter().any(|r| {
            catalog
                .section(*r)
                .is_some_and(|rs| rs.subpart_id == section.subpart_id)
        });
        !restricted_subpart || record.section_ids.contains(section_id)
    })
}

/// Why a candidate failed the capacity/eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityFailure {
    /// A must-be-used reservation applies and none covers the candidate.
    Ineligible,
    Full { section_id: Option<SectionId> },
}

fn has_room(limit: Option<u32>, held: u32, own: bool) -> bool {
    match limit {
        None => true,
        Some(limit) => held.saturating_sub(own as u32) < limit,
    }
}

/// Pick the reservation (if any) under which the candidate fits.
///
/// Held counts of the student's own prior enrollment do not count against
/// the candidate. Reservations are tried in priority order; a reservation
/// with `can_assign_over_limit` lifts the section, config and course limits.
pub fn choose(
    catalog: &Catalog,
    student_id: StudentId,
    course_id: CourseId,
    config_id: ConfigId,
    sections: &[SectionId],
    prior: Option<&EnrollmentRecord>,
) -> Result<Option<ReservationId>, CapacityFailure> {
    let reservations = applicable(catalog, student_id, course_id);
    let must_be_used = reservations.iter().any(|r| r.record.must_be_used);

    let mut options: Vec<Option<&Reservation>> = reservations
        .iter()
        .copied()
        .filter(|r| covers(catalog, r, config_id, sections))
        .filter(|r| {
            let own = prior.is_some_and(|p| p.reservation_id == Some(r.id()));
            has_room(r.record.limit, r.held, own)
        })
        .map(Some)
        .collect();
    if !must_be_used {
        options.push(None);
    } else if options.is_empty() {
        return Err(CapacityFailure::Ineligible);
    }

    let mut failure = CapacityFailure::Full { section_id: None };
    for option in options {
        let over_limit = option.is_some_and(|r| r.record.can_assign_over_limit);
        if over_limit {
            return Ok(option.map(|r| r.id()));
        }
        match first_full(catalog, course_id, config_id, sections, prior) {
            None => return Ok(option.map(|r| r.id())),
            Some(full) => failure = CapacityFailure::Full { section_id: full },
        }
    }
    Err(failure)
}

/// The first limit the candidate would exceed: `Some(Some(section))`, or
/// `Some(None)` for a config/course limit.
fn first_full(
    catalog: &Catalog,
    course_id: CourseId,
    config_id: ConfigId,
    sections: &[SectionId],
    prior: Option<&EnrollmentRecord>,
) -> Option<Option<SectionId>> {
    for section_id in sections {
        let section = catalog.section(*section_id)?;
        let own = prior.is_some_and(|p| p.section_ids.contains(section_id));
        if !has_room(section.limit, section.held, own) {
            return Some(Some(*section_id));
        }
    }
    if let Some(config) = catalog.config(config_id) {
        let own = prior.is_some_and(|p| p.config_id == config_id);
        if !has_room(config.limit, config.held, own) {
            return Some(None);
        }
    }
    if let Some(course) = catalog.course(course_id) {
        let own = prior.is_some_and(|p| p.course_id == course_id);
        if !has_room(course.limit, course.held, own) {
            return Some(None);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::*;

    fn reservation(id: ReservationId, scope: ReservationScope) -> ReservationRecord {
        ReservationRecord {
            id,
            offering_id: 1,
            scope,
            limit: None,
            must_be_used: false,
            can_assign_over_limit: false,
            expired: false,
            config_ids: vec![],
            section_ids: vec![],
        }
    }

    fn catalog_with(reservations: Vec<ReservationRecord>, held: u32) -> Catalog {
        let offering = offering(
            1,
            vec![
                section(11, MON_WED, TEN_AM, Some(1)),
                section(12, TUE_THU, TEN_AM, Some(5)),
            ],
        );
        let students = (0..held)
            .map(|i| {
                let mut cr = course_request(1, vec![10]);
                cr.enrollment = Some(enrollment(1, vec![11]));
                student(100 + i as u64, vec![RequestRecord::Course(cr)])
            })
            .collect();
        let mut snap = snapshot(vec![offering], students);
        snap.reservations = reservations;
        Catalog::from_snapshot(snap)
    }

    #[test]
    fn reservations_sorted_by_scope() {
        let catalog = catalog_with(
            vec![
                reservation(1, ReservationScope::Course { course_id: 10 }),
                reservation(2, ReservationScope::Individual { students: vec![7] }),
                reservation(3, ReservationScope::Group {
                    name: "athletes".into(),
                    students: vec![7],
                }),
                reservation(4, ReservationScope::Individual { students: vec![8] }),
            ],
            0,
        );
        let ids: Vec<ReservationId> = applicable(&catalog, 7, 10).iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        assert!(has_individual(&catalog, 7, &[10]));
        assert!(!has_individual(&catalog, 9, &[10]));
    }

    #[test]
    fn expired_reservation_is_ignored() {
        let mut expired = reservation(1, ReservationScope::Individual { students: vec![7] });
        expired.expired = true;
        let catalog = catalog_with(vec![expired], 0);
        assert!(applicable(&catalog, 7, 10).is_empty());
    }

    #[test]
    fn full_section_is_rejected_without_override() {
        let catalog = catalog_with(vec![], 1);
        assert_eq!(
            choose(&catalog, 7, 10, 100, &[11], None),
            Err(CapacityFailure::Full { section_id: Some(11) })
        );
        assert_eq!(choose(&catalog, 7, 10, 100, &[12], None), Ok(None));
    }

    #[test]
    fn own_prior_seat_counts_as_free() {
        let catalog = catalog_with(vec![], 1);
        let prior = enrollment(1, vec![11]);
        assert_eq!(choose(&catalog, 100, 10, 100, &[11], Some(&prior)), Ok(None));
    }

    #[test]
    fn over_limit_reservation_lifts_limits() {
        let mut res = reservation(5, ReservationScope::Individual { students: vec![7] });
        res.can_assign_over_limit = true;
        let catalog = catalog_with(vec![res], 1);
        assert_eq!(choose(&catalog, 7, 10, 100, &[11], None), Ok(Some(5)));
    }

    #[test]
    fn must_be_used_reservation_restricts_sections() {
        let mut res = reservation(5, ReservationScope::Group {
            name: "honors".into(),
            students: vec![7],
        });
        res.must_be_used = true;
        res.section_ids = vec![12];
        let catalog = catalog_with(vec![res], 0);

        assert_eq!(
            choose(&catalog, 7, 10, 100, &[11], None),
            Err(CapacityFailure::Ineligible)
        );
        assert_eq!(choose(&catalog, 7, 10, 100, &[12], None), Ok(Some(5)));
    }

    #[test]
    fn full_reservation_falls_back_to_open_space() {
        let mut res = reservation(5, ReservationScope::Course { course_id: 10 });
        res.limit = Some(0);
        let catalog = catalog_with(vec![res], 0);
        assert_eq!(choose(&catalog, 7, 10, 100, &[12], None), Ok(None));
    }
}
