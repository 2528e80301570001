use serde::Serialize;

use crate::model::{Employee, RoleRequirement};

/// Candidates are pre-filtered by role, so every scored candidate carries the
/// base qualifier; the discriminating terms are availability, mobility and
/// proximity.
pub const ROLE_MATCH_WEIGHT: i64 = 5;
pub const AVAILABILITY_WEIGHT: i64 = 4;
pub const VEHICLE_WEIGHT: i64 = 3;
pub const PROXIMITY_WEIGHT: i64 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub worker_id: String,
    pub score: i64,
    pub distance_km: f64,
    pub rating: f64,
}

/// Scores one (employee, requirement) pair. Pure; the only input that can be
/// degenerate is `distance_km`, which may be infinite for unresolved
/// entities.
pub fn score_candidate(
    employee: &Employee,
    requirement: &RoleRequirement,
    distance_km: f64,
    proximity_threshold_km: f64,
) -> ScoredCandidate {
    let mut score = ROLE_MATCH_WEIGHT;

    if employee
        .availability
        .intersection(&requirement.work_schedule)
        .next()
        .is_some()
    {
        score += AVAILABILITY_WEIGHT;
    }
    if employee.have_car {
        score += VEHICLE_WEIGHT;
    }
    if distance_km <= proximity_threshold_km {
        score += PROXIMITY_WEIGHT;
    }

    ScoredCandidate {
        worker_id: employee.worker_id.clone(),
        score,
        distance_km,
        rating: employee.rating,
    }
}
