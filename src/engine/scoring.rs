use std::cmp::Ordering;

use uuid::Uuid;

use crate::geo::manhattan_distance;
use crate::models::chair::{Chair, Coordinate};

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchCandidate {
    pub chair_id: Uuid,
    pub pickup_distance: i64,
    pub estimated_travel_time: f64,
}

/// Time for a chair at `location` to reach `pickup`. `None` for chairs
/// without a usable speed, which therefore cannot be ranked.
pub fn estimated_travel_time(location: &Coordinate, speed: u32, pickup: &Coordinate) -> Option<f64> {
    if speed == 0 {
        return None;
    }

    let distance = manhattan_distance(location, pickup);
    Some(distance as f64 / f64::from(speed))
}

pub fn score_candidate(chair: &Chair, location: &Coordinate, pickup: &Coordinate) -> Option<DispatchCandidate> {
    let estimated_travel_time = estimated_travel_time(location, chair.speed, pickup)?;

    Some(DispatchCandidate {
        chair_id: chair.id,
        pickup_distance: manhattan_distance(location, pickup),
        estimated_travel_time,
    })
}

/// Fastest arrival first; equal estimates fall back to chair id so the
/// ranking is deterministic.
pub fn rank_candidates(mut candidates: Vec<DispatchCandidate>) -> Vec<DispatchCandidate> {
    candidates.sort_by(compare_candidates);
    candidates
}

fn compare_candidates(a: &DispatchCandidate, b: &DispatchCandidate) -> Ordering {
    a.estimated_travel_time
        .total_cmp(&b.estimated_travel_time)
        .then_with(|| a.chair_id.cmp(&b.chair_id))
}
