//! Candidate weighting.

use crate::catalog::Section;
use crate::optimizer::{Candidate, ProblemSnapshot};

/// Scores one candidate; higher is better.
pub trait WeightFunction: Send + Sync {
    fn weight(&self, problem: &ProblemSnapshot<'_>, candidate: &Candidate) -> f64;
}

/// Rewards staying close to the student's last section choice and
/// penalises distance conflicts, soft free-time overlaps and sections that
/// are expected to overflow. Every term is averaged over the candidate's
/// sections, so the similarity reward outweighs the sum of the penalties.
#[derive(Debug, Clone, Copy)]
pub struct DefaultWeights {
    pub alternative_penalty: f64,
    pub same_section: f64,
    pub same_time: f64,
    pub same_room: f64,
    pub same_instructor: f64,
    pub distance_penalty: f64,
    pub free_time_penalty: f64,
    pub overload_penalty: f64,
}

impl Default for DefaultWeights {
    fn default() -> Self {
        Self {
            alternative_penalty: 0.5,
            same_section: 5.0,
            same_time: 1.0,
            same_room: 0.5,
            same_instructor: 0.5,
            distance_penalty: 1.0,
            free_time_penalty: 1.0,
            overload_penalty: 1.0,
        }
    }
}

impl DefaultWeights {
    fn similarity(&self, problem: &ProblemSnapshot<'_>, section: &Section) -> f64 {
        let catalog = problem.catalog;
        let subpart_name = catalog.subpart(section.subpart_id).map(|s| s.name.as_str());
        let mut best = 0.0_f64;
        for reference in problem.request.reference_sections() {
            if *reference == section.id {
                return self.same_section;
            }
            let Some(other) = catalog.section(*reference) else {
                continue;
            };
            if catalog.subpart(other.subpart_id).map(|s| s.name.as_str()) != subpart_name {
                continue;
            }
            let mut score = 0.0;
            if other.time.is_some() && other.time == section.time {
                score += self.same_time;
            }
            if other.rooms.iter().any(|r| section.rooms.iter().any(|s| s.id == r.id)) {
                score += self.same_room;
            }
            if other.instructors.iter().any(|i| section.instructors.contains(i)) {
                score += self.same_instructor;
            }
            best = best.max(score);
        }
        best
    }

    fn overload(&self, problem: &ProblemSnapshot<'_>, section: &Section) -> f64 {
        let Some(limit) = section.limit else {
            return 0.0;
        };
        let own = problem
            .request
            .prior
            .as_ref()
            .is_some_and(|p| p.section_ids.contains(&section.id));
        let demand = section.held.saturating_sub(own as u32) as f64 + section.expected;
        if limit == 0 {
            return 1.0;
        }
        ((demand + 1.0 - limit as f64) / limit as f64).clamp(0.0, 1.0)
    }
}

impl WeightFunction for DefaultWeights {
    fn weight(&self, problem: &ProblemSnapshot<'_>, candidate: &Candidate) -> f64 {
        let sections: Vec<&Section> = candidate
            .sections
            .iter()
            .filter_map(|s| problem.catalog.section(*s))
            .collect();
        if sections.is_empty() {
            return 0.0;
        }
        let n = sections.len() as f64;

        let mut similarity = 0.0;
        let mut distance = 0.0;
        let mut free_time = 0.0;
        let mut overload = 0.0;
        for section in &sections {
            similarity += self.similarity(problem, section);
            overload += self.overload(problem, section);
            let Some(time) = &section.time else {
                continue;
            };
            for block in &problem.blocks {
                if !block.hard && block.time.overlaps(time) {
                    free_time += 1.0;
                }
                if block.section_id.is_some()
                    && problem.distance.in_conflict(time, &section.rooms, &block.time, &block.rooms)
                {
                    distance += 1.0;
                }
            }
        }

        similarity / n
            - self.alternative_penalty * candidate.course_index as f64
            - self.distance_penalty * (distance / n).min(1.0)
            - self.free_time_penalty * (free_time / n).min(1.0)
            - self.overload_penalty * overload / n
    }
}
