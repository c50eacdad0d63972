//! In-memory catalog of one academic session.
//!
//! An arena of offerings, courses, configs, subparts and sections keyed by
//! their integer ids, plus reservations and students. Built from a
//! `SessionSnapshot`; the held counters are derived from the students'
//! enrollments at load time. The whole catalog sits behind one mutex in
//! the solver instance, so nothing here synchronises.

use std::collections::{BTreeMap, HashMap};

use solvergrid_state::*;

#[derive(Debug, Clone)]
pub struct Offering {
    pub id: OfferingId,
    pub courses: Vec<CourseId>,
    pub configs: Vec<ConfigId>,
}

#[derive(Debug, Clone)]
pub struct Course {
    pub id: CourseId,
    pub name: String,
    pub offering_id: OfferingId,
    pub limit: Option<u32>,
    pub deadlines: Option<DeadlineWeeks>,
    pub held: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub id: ConfigId,
    pub name: String,
    pub offering_id: OfferingId,
    pub limit: Option<u32>,
    /// Parents before children.
    pub subparts: Vec<SubpartId>,
    pub held: u32,
}

#[derive(Debug, Clone)]
pub struct Subpart {
    pub id: SubpartId,
    pub name: String,
    pub config_id: ConfigId,
    pub parent_id: Option<SubpartId>,
    pub sections: Vec<SectionId>,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub id: SectionId,
    pub name: String,
    pub offering_id: OfferingId,
    pub config_id: ConfigId,
    pub subpart_id: SubpartId,
    pub parent_id: Option<SectionId>,
    pub time: Option<TimePattern>,
    pub rooms: Vec<RoomRecord>,
    pub instructors: Vec<String>,
    pub limit: Option<u32>,
    /// Committed enrollments.
    pub held: u32,
    /// Fractional demand spread across students' open alternatives.
    pub expected: f64,
}

impl Section {
    pub fn overlaps(&self, other: &Section) -> bool {
        match (&self.time, &other.time) {
            (Some(a), Some(b)) => a.overlaps(b),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub record: ReservationRecord,
    pub held: u32,
}

impl Reservation {
    pub fn id(&self) -> ReservationId {
        self.record.id
    }
}

/// A time block the student is already committed to.
#[derive(Debug, Clone)]
pub struct AssignedBlock {
    pub request_id: RequestId,
    pub section_id: Option<SectionId>,
    pub time: TimePattern,
    pub rooms: Vec<RoomRecord>,
    /// Soft blocks (less important free time) only lower a candidate's weight.
    pub hard: bool,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    session: SessionRecord,
    offerings: BTreeMap<OfferingId, Offering>,
    courses: BTreeMap<CourseId, Course>,
    configs: BTreeMap<ConfigId, Config>,
    subparts: BTreeMap<SubpartId, Subpart>,
    sections: BTreeMap<SectionId, Section>,
    reservations: BTreeMap<ReservationId, Reservation>,
    students: BTreeMap<StudentId, StudentRecord>,
    /// Expected-space credits handed out per unassigned request.
    pub(crate) expected_credits: HashMap<(StudentId, RequestId), Vec<(SectionId, f64)>>,
}

impl Catalog {
    /// Build the catalog and derive held counters from existing enrollments.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let mut catalog = Catalog {
            session: snapshot.session,
            offerings: BTreeMap::new(),
            courses: BTreeMap::new(),
            configs: BTreeMap::new(),
            subparts: BTreeMap::new(),
            sections: BTreeMap::new(),
            reservations: BTreeMap::new(),
            students: BTreeMap::new(),
            expected_credits: HashMap::new(),
        };

        for offering in snapshot.offerings {
            catalog.insert_offering(offering);
        }
        for record in snapshot.reservations {
            catalog
                .reservations
                .insert(record.id, Reservation { record, held: 0 });
        }
        for student in snapshot.students {
            catalog.students.insert(student.id, student);
        }

        let enrollments: Vec<EnrollmentRecord> = catalog
            .students
            .values()
            .flat_map(|s| s.requests.iter())
            .filter_map(|r| match r {
                RequestRecord::Course(cr) => cr.enrollment.clone(),
                RequestRecord::FreeTime(_) => None,
            })
            .collect();
        for enrollment in &enrollments {
            catalog.adjust_held(enrollment, 1);
        }
        catalog
    }

    fn insert_offering(&mut self, offering: OfferingRecord) {
        let offering_id = offering.id;
        let mut course_ids = Vec::new();
        for course in offering.courses {
            course_ids.push(course.id);
            self.courses.insert(
                course.id,
                Course {
                    id: course.id,
                    name: course.name,
                    offering_id,
                    limit: course.limit,
                    deadlines: course.deadlines,
                    held: 0,
                },
            );
        }

        let mut config_ids = Vec::new();
        for config in offering.configs {
            config_ids.push(config.id);
            let ordered = order_subparts(&config.subparts);
            let mut subpart_ids = Vec::new();
            for subpart in config.subparts {
                let mut section_ids = Vec::new();
                for section in subpart.sections {
                    section_ids.push(section.id);
                    self.sections.insert(
                        section.id,
                        Section {
                            id: section.id,
                            name: section.name,
                            offering_id,
                            config_id: config.id,
                            subpart_id: subpart.id,
                            parent_id: section.parent_id,
                            time: section.time,
                            rooms: section.rooms,
                            instructors: section.instructors,
                            limit: section.limit,
                            held: 0,
                            expected: 0.0,
                        },
                    );
                }
                subpart_ids.push(subpart.id);
                self.subparts.insert(
                    subpart.id,
                    Subpart {
                        id: subpart.id,
                        name: subpart.name,
                        config_id: config.id,
                        parent_id: subpart.parent_id,
                        sections: section_ids,
                    },
                );
            }
            debug_assert_eq!(ordered.len(), subpart_ids.len());
            self.configs.insert(
                config.id,
                Config {
                    id: config.id,
                    name: config.name,
                    offering_id,
                    limit: config.limit,
                    subparts: ordered,
                    held: 0,
                },
            );
        }

        self.offerings.insert(
            offering_id,
            Offering {
                id: offering_id,
                courses: course_ids,
                configs: config_ids,
            },
        );
    }

    // ── Lookups ────────────────────────────────────────────────────

    pub fn session(&self) -> &SessionRecord {
        &self.session
    }

    pub fn offering(&self, id: OfferingId) -> Option<&Offering> {
        self.offerings.get(&id)
    }

    pub fn course(&self, id: CourseId) -> Option<&Course> {
        self.courses.get(&id)
    }

    pub fn config(&self, id: ConfigId) -> Option<&Config> {
        self.configs.get(&id)
    }

    pub fn subpart(&self, id: SubpartId) -> Option<&Subpart> {
        self.subparts.get(&id)
    }

    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.sections.get(&id)
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.values()
    }

    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.get(&id)
    }

    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    pub fn student(&self, id: StudentId) -> Option<&StudentRecord> {
        self.students.get(&id)
    }

    pub fn students(&self) -> impl Iterator<Item = &StudentRecord> {
        self.students.values()
    }

    pub fn offering_count(&self) -> usize {
        self.offerings.len()
    }

    pub fn student_count(&self) -> usize {
        self.students.len()
    }

    pub fn enrollment_count(&self) -> usize {
        self.students
            .values()
            .flat_map(|s| s.requests.iter())
            .filter(|r| matches!(r, RequestRecord::Course(cr) if cr.enrollment.is_some()))
            .count()
    }

    // ── Mutation ───────────────────────────────────────────────────

    /// Replace the enrollment of one course request. Counters are left to
    /// the `SpaceAccountant`.
    pub fn set_enrollment(
        &mut self,
        student_id: StudentId,
        request_id: RequestId,
        enrollment: Option<EnrollmentRecord>,
    ) -> bool {
        match self
            .students
            .get_mut(&student_id)
            .and_then(|s| s.course_request_mut(request_id))
        {
            Some(request) => {
                request.enrollment = enrollment;
                true
            }
            None => false,
        }
    }

    /// Add `delta` to every held counter touched by `enrollment`.
    pub(crate) fn adjust_held(&mut self, enrollment: &EnrollmentRecord, delta: i32) {
        fn apply(counter: &mut u32, delta: i32) {
            *counter = counter.saturating_add_signed(delta);
        }
        for section_id in &enrollment.section_ids {
            if let Some(section) = self.sections.get_mut(section_id) {
                apply(&mut section.held, delta);
            }
        }
        if let Some(config) = self.configs.get_mut(&enrollment.config_id) {
            apply(&mut config.held, delta);
        }
        if let Some(course) = self.courses.get_mut(&enrollment.course_id) {
            apply(&mut course.held, delta);
        }
        if let Some(reservation) = enrollment
            .reservation_id
            .and_then(|id| self.reservations.get_mut(&id))
        {
            apply(&mut reservation.held, delta);
        }
    }

    pub(crate) fn section_mut(&mut self, id: SectionId) -> Option<&mut Section> {
        self.sections.get_mut(&id)
    }

    pub(crate) fn sections_mut(&mut self) -> impl Iterator<Item = &mut Section> {
        self.sections.values_mut()
    }

    // ── Structure ──────────────────────────────────────────────────

    /// Every structurally valid enrollment of a course: one section per
    /// subpart of a config, children consistent with their parent section,
    /// no two sections overlapping. Stops after `max` results.
    pub fn enumerate_enrollments(&self, course_id: CourseId, max: usize) -> Vec<(ConfigId, Vec<SectionId>)> {
        let mut out = Vec::new();
        let Some(offering) = self
            .course(course_id)
            .and_then(|c| self.offering(c.offering_id))
        else {
            return out;
        };
        for config_id in &offering.configs {
            let Some(config) = self.config(*config_id) else {
                continue;
            };
            let mut chosen = Vec::with_capacity(config.subparts.len());
            let mut combos = Vec::new();
            self.extend(&config.subparts, &mut chosen, &mut combos, max.saturating_sub(out.len()));
            out.extend(combos.into_iter().map(|sections| (*config_id, sections)));
            if out.len() >= max {
                break;
            }
        }
        out
    }

    fn extend(&self, subparts: &[SubpartId], chosen: &mut Vec<SectionId>, out: &mut Vec<Vec<SectionId>>, max: usize) {
        if out.len() >= max {
            return;
        }
        let Some((first, rest)) = subparts.split_first() else {
            out.push(chosen.clone());
            return;
        };
        let Some(subpart) = self.subpart(*first) else {
            return;
        };
        for section_id in &subpart.sections {
            let Some(section) = self.section(*section_id) else {
                continue;
            };
            if section.parent_id.is_some_and(|p| !chosen.contains(&p)) {
                continue;
            }
            let clash = chosen
                .iter()
                .filter_map(|c| self.section(*c))
                .any(|c| c.overlaps(section));
            if clash {
                continue;
            }
            chosen.push(*section_id);
            self.extend(rest, chosen, out, max);
            chosen.pop();
            if out.len() >= max {
                return;
            }
        }
    }

    /// The student's other committed time blocks.
    ///
    /// Enrollments of other course requests are hard blocks. Free-time
    /// requests more important than `priority` are hard, the rest soft.
    /// Fails with the offending request id when an enrollment references a
    /// section that is not in the catalog.
    pub fn other_assignments(
        &self,
        student: &StudentRecord,
        request_id: RequestId,
        priority: u32,
    ) -> Result<Vec<AssignedBlock>, RequestId> {
        let mut blocks = Vec::new();
        for request in &student.requests {
            if request.id() == request_id {
                continue;
            }
            match request {
                RequestRecord::FreeTime(ft) => blocks.push(AssignedBlock {
                    request_id: ft.id,
                    section_id: None,
                    time: ft.time,
                    rooms: Vec::new(),
                    hard: ft.priority < priority,
                }),
                RequestRecord::Course(cr) => {
                    let Some(enrollment) = &cr.enrollment else {
                        continue;
                    };
                    for section_id in &enrollment.section_ids {
                        let section = self.section(*section_id).ok_or(cr.id)?;
                        if let Some(time) = section.time {
                            blocks.push(AssignedBlock {
                                request_id: cr.id,
                                section_id: Some(section.id),
                                time,
                                rooms: section.rooms.clone(),
                                hard: true,
                            });
                        }
                    }
                }
            }
        }
        Ok(blocks)
    }

    /// Back to a persistable snapshot.
    pub fn student_records(&self) -> Vec<StudentRecord> {
        self.students.values().cloned().collect()
    }
}

/// Order subparts so that every parent precedes its children.
fn order_subparts(subparts: &[SubpartRecord]) -> Vec<SubpartId> {
    let mut ordered: Vec<SubpartId> = Vec::with_capacity(subparts.len());
    let mut remaining: Vec<&SubpartRecord> = subparts.iter().collect();
    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|s| match s.parent_id {
            Some(parent) if !ordered.contains(&parent) && subparts.iter().any(|p| p.id == parent) => true,
            _ => {
                ordered.push(s.id);
                false
            }
        });
        if remaining.len() == before {
            // Cyclic parents; keep record order.
            ordered.extend(remaining.iter().map(|s| s.id));
            break;
        }
    }
    ordered
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn held_counts_derive_from_enrollments() {
        let mut cr = course_request(1, vec![10]);
        cr.enrollment = Some(enrollment(1, vec![11]));
        let catalog = Catalog::from_snapshot(snapshot(
            vec![offering(1, vec![section(11, MON_WED, TEN_AM, Some(30))])],
            vec![student(7, vec![RequestRecord::Course(cr)])],
        ));

        assert_eq!(catalog.section(11).unwrap().held, 1);
        assert_eq!(catalog.config(100).unwrap().held, 1);
        assert_eq!(catalog.course(10).unwrap().held, 1);
        assert_eq!(catalog.enrollment_count(), 1);
    }

    #[test]
    fn enumeration_respects_parent_sections() {
        let mut lec_a = section(11, MON_WED, TEN_AM, None);
        lec_a.name = "Lec A".into();
        let lec_b = section(12, TUE_THU, TEN_AM, None);
        let mut rec_a = section(21, TUE_THU, TEN_AM + 24, None);
        rec_a.parent_id = Some(11);
        let mut rec_b = section(22, MON_WED, TEN_AM + 24, None);
        rec_b.parent_id = Some(12);

        let mut offering = offering(1, vec![lec_a, lec_b]);
        offering.configs[0].subparts.push(SubpartRecord {
            id: 1001,
            name: "Rec".into(),
            parent_id: Some(1000),
            sections: vec![rec_a, rec_b],
        });
        let catalog = Catalog::from_snapshot(snapshot(vec![offering], vec![]));

        let combos = catalog.enumerate_enrollments(10, 100);
        let sections: Vec<Vec<SectionId>> = combos.into_iter().map(|(_, s)| s).collect();
        assert_eq!(sections, vec![vec![11, 21], vec![12, 22]]);
    }

    #[test]
    fn enumeration_skips_overlapping_combinations() {
        let lec = section(11, MON_WED, TEN_AM, None);
        let clash = section(21, MON_WED, TEN_AM + 6, None);
        let fine = section(22, TUE_THU, TEN_AM, None);
        let mut offering = offering(1, vec![lec]);
        offering.configs[0].subparts.push(SubpartRecord {
            id: 1001,
            name: "Lab".into(),
            parent_id: None,
            sections: vec![clash, fine],
        });
        let catalog = Catalog::from_snapshot(snapshot(vec![offering], vec![]));

        let combos = catalog.enumerate_enrollments(10, 100);
        assert_eq!(combos, vec![(100, vec![11, 22])]);
    }

    #[test]
    fn child_subpart_listed_first_is_reordered() {
        let subparts = vec![
            SubpartRecord {
                id: 2,
                name: "Rec".into(),
                parent_id: Some(1),
                sections: vec![],
            },
            SubpartRecord {
                id: 1,
                name: "Lec".into(),
                parent_id: None,
                sections: vec![],
            },
        ];
        assert_eq!(order_subparts(&subparts), vec![1, 2]);
    }

    #[test]
    fn dangling_enrollment_is_reported() {
        let mut other = course_request(2, vec![20]);
        other.enrollment = Some(enrollment(2, vec![999]));
        let record = student(7, vec![RequestRecord::Course(course_request(1, vec![10])), RequestRecord::Course(other)]);
        let catalog = Catalog::from_snapshot(snapshot(
            vec![offering(1, vec![section(11, MON_WED, TEN_AM, None)])],
            vec![record.clone()],
        ));
        assert_eq!(catalog.other_assignments(&record, 1, 0).unwrap_err(), 2);
    }

    #[test]
    fn free_time_hardness_follows_priority() {
        let ft = RequestRecord::FreeTime(FreeTimeRequestRecord {
            id: 5,
            priority: 1,
            time: TimePattern::new(MON_WED, 0, 12),
        });
        let record = student(7, vec![ft]);
        let catalog = Catalog::from_snapshot(snapshot(vec![], vec![record.clone()]));

        let blocks = catalog.other_assignments(&record, 1, 2).unwrap();
        assert!(blocks[0].hard);
        let blocks = catalog.other_assignments(&record, 1, 0).unwrap();
        assert!(!blocks[0].hard);
    }
}
