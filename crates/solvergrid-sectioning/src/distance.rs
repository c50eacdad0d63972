//! Distance conflicts between back-to-back meetings.

use solvergrid_core::config::SectioningConfig;
use solvergrid_state::{RoomRecord, TimePattern};

/// Two meetings are in distance conflict when the second starts within the
/// break after the first and some pair of their rooms is further apart
/// than the student can walk.
#[derive(Debug, Clone, Copy)]
pub struct DistanceMetric {
    pub limit_meters: f64,
    pub break_slots: u16,
}

impl DistanceMetric {
    pub fn from_config(config: &SectioningConfig) -> Self {
        Self {
            limit_meters: config.distance_limit_meters,
            break_slots: config.distance_break_slots,
        }
    }

    pub fn in_conflict(&self, a: &TimePattern, a_rooms: &[RoomRecord], b: &TimePattern, b_rooms: &[RoomRecord]) -> bool {
        if !a.shares_days(b) {
            return false;
        }
        let back_to_back = (a.end_slot() <= b.start_slot && b.start_slot <= a.end_slot() + self.break_slots)
            || (b.end_slot() <= a.start_slot && a.start_slot <= b.end_slot() + self.break_slots);
        if !back_to_back {
            return false;
        }
        a_rooms
            .iter()
            .any(|ra| b_rooms.iter().any(|rb| meters(ra, rb).is_some_and(|d| d > self.limit_meters)))
    }
}

/// Euclidean distance when both rooms have coordinates.
pub fn meters(a: &RoomRecord, b: &RoomRecord) -> Option<f64> {
    if a.id == b.id {
        return Some(0.0);
    }
    let (ax, ay, bx, by) = (a.x?, a.y?, b.x?, b.y?);
    Some(((ax - bx).powi(2) + (ay - by).powi(2)).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::{MON_WED, TEN_AM, room};

    const METRIC: DistanceMetric = DistanceMetric {
        limit_meters: 670.0,
        break_slots: 2,
    };

    #[test]
    fn far_rooms_back_to_back_conflict() {
        let first = TimePattern::new(MON_WED, TEN_AM, 10);
        let second = TimePattern::new(MON_WED, TEN_AM + 12, 10);
        let near = [room(1, 0.0, 0.0)];
        let far = [room(2, 1000.0, 0.0)];

        assert!(METRIC.in_conflict(&first, &near, &second, &far));
        assert!(METRIC.in_conflict(&second, &far, &first, &near));
        assert!(!METRIC.in_conflict(&first, &near, &second, &[room(3, 100.0, 0.0)]));
    }

    #[test]
    fn long_break_is_not_a_conflict() {
        let first = TimePattern::new(MON_WED, TEN_AM, 10);
        let later = TimePattern::new(MON_WED, TEN_AM + 30, 10);
        assert!(!METRIC.in_conflict(&first, &[room(1, 0.0, 0.0)], &later, &[room(2, 1000.0, 0.0)]));
    }

    #[test]
    fn rooms_without_coordinates_have_no_distance() {
        let mut a = room(1, 0.0, 0.0);
        a.x = None;
        assert_eq!(meters(&a, &room(2, 5.0, 5.0)), None);
        assert_eq!(meters(&a, &a.clone()), Some(0.0));
    }
}
