//! Enrollment deadlines.
//!
//! Each section is checked against the week it first meets. A new
//! assignment uses the enroll deadline for every section; when a prior
//! enrollment exists, sections it already contains keep the enroll rule and
//! the sections that differ use the stricter change rule.

use serde::{Deserialize, Serialize};

use solvergrid_core::config::SectioningConfig;
use solvergrid_state::{CourseId, DeadlineWeeks, EnrollmentRecord, SectionId};

use crate::catalog::Catalog;

const SECS_PER_WEEK: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineRule {
    New,
    Change,
    Drop,
}

impl DeadlineRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadlineRule::New => "enroll",
            DeadlineRule::Change => "change",
            DeadlineRule::Drop => "drop",
        }
    }

    fn weeks(&self, deadlines: &DeadlineWeeks) -> i32 {
        match self {
            DeadlineRule::New => deadlines.enroll,
            DeadlineRule::Change => deadlines.change,
            DeadlineRule::Drop => deadlines.drop,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    defaults: DeadlineWeeks,
}

impl Deadlines {
    pub fn new(defaults: DeadlineWeeks) -> Self {
        Self { defaults }
    }

    pub fn from_config(config: &SectioningConfig) -> Self {
        Self::new(DeadlineWeeks {
            enroll: config.last_week_to_enroll,
            change: config.last_week_to_change,
            drop: config.last_week_to_drop,
        })
    }

    /// Week index of `now_secs` relative to the session start; negative before it.
    pub fn current_week(catalog: &Catalog, now_secs: u64) -> i32 {
        let begin = catalog.session().begin_epoch_secs as i64;
        (now_secs as i64 - begin).div_euclid(SECS_PER_WEEK) as i32
    }

    /// Whether `section_id` of `course_id` may still be touched under `rule`
    /// in `week`. Sections without a meeting time have no deadline.
    pub fn allows(
        &self,
        catalog: &Catalog,
        course_id: CourseId,
        section_id: SectionId,
        rule: DeadlineRule,
        week: i32,
    ) -> bool {
        let Some(section) = catalog.section(section_id) else {
            return false;
        };
        let Some(first_week) = section.time.and_then(|t| t.first_week()) else {
            return true;
        };
        let deadlines = catalog
            .course(course_id)
            .and_then(|c| c.deadlines)
            .unwrap_or(self.defaults);
        week < first_week as i32 + rule.weeks(&deadlines)
    }

    /// First section of a candidate that misses its deadline.
    pub fn check_candidate(
        &self,
        catalog: &Catalog,
        course_id: CourseId,
        sections: &[SectionId],
        prior: Option<&EnrollmentRecord>,
        week: i32,
    ) -> Option<(SectionId, DeadlineRule)> {
        sections.iter().find_map(|section_id| {
            let rule = match prior {
                Some(p) if !p.section_ids.contains(section_id) => DeadlineRule::Change,
                _ => DeadlineRule::New,
            };
            (!self.allows(catalog, course_id, *section_id, rule, week)).then_some((*section_id, rule))
        })
    }

    /// First section of the enrollment past its drop deadline.
    pub fn check_drop(&self, catalog: &Catalog, enrollment: &EnrollmentRecord, week: i32) -> Option<SectionId> {
        enrollment
            .section_ids
            .iter()
            .copied()
            .find(|s| !self.allows(catalog, enrollment.course_id, *s, DeadlineRule::Drop, week))
    }
}
