use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use crate::distance::distance_km;
use crate::model::{Assignment, Employee, JobSite};
use crate::scoring::{score_candidate, ScoredCandidate};
use crate::store::make_assignment;

#[derive(Debug, Clone, Serialize)]
pub struct RoleFill {
    pub site_id: String,
    pub role: String,
    pub required: u32,
    pub assigned: u32,
}

impl RoleFill {
    pub fn is_filled(&self) -> bool {
        self.assigned >= self.required
    }
}

#[derive(Debug, Default)]
pub struct AllocationOutcome {
    pub assignments: Vec<Assignment>,
    pub fills: Vec<RoleFill>,
}

/// Greedy allocation over every (site, role) pair. Strictly sequential: the
/// exclusion set is shared across all sites and roles of one run and is
/// updated the moment a candidate is taken, so an employee never appears
/// twice. Sites are visited in input order, roles in the requirement map's
/// stored order. A role that cannot fill its headcount ends short; that is
/// reported through `RoleFill`, not an error.
pub fn allocate(
    sites: &[JobSite],
    pool: &[Employee],
    assigned: &mut HashSet<String>,
    proximity_threshold_km: f64,
) -> AllocationOutcome {
    let mut outcome = AllocationOutcome::default();

    for site in sites {
        for (role, requirement) in &site.required_roles {
            if requirement.num_workers == 0 {
                continue;
            }

            let mut candidates: Vec<ScoredCandidate> = pool
                .iter()
                .filter(|employee| {
                    employee.qualified_for(role) && !assigned.contains(&employee.worker_id)
                })
                .map(|employee| {
                    let km = distance_km(employee.coordinates(), site.coordinates());
                    score_candidate(employee, requirement, km, proximity_threshold_km)
                })
                .collect();

            // Tie-break order is load-bearing: capability first, then
            // proximity, then rating.
            candidates.sort_by(|a, b| {
                b.score
                    .cmp(&a.score)
                    .then_with(|| a.distance_km.total_cmp(&b.distance_km))
                    .then_with(|| b.rating.total_cmp(&a.rating))
            });

            let mut filled = 0;
            for candidate in candidates {
                if filled >= requirement.num_workers {
                    break;
                }
                assigned.insert(candidate.worker_id.clone());
                outcome.assignments.push(make_assignment(
                    &candidate.worker_id,
                    &site.site_id,
                    role,
                    candidate.distance_km,
                ));
                filled += 1;
            }

            if filled < requirement.num_workers {
                debug!(
                    site_id = site.site_id,
                    role,
                    required = requirement.num_workers,
                    filled,
                    "role requirement left short"
                );
            }
            outcome.fills.push(RoleFill {
                site_id: site.site_id.clone(),
                role: role.clone(),
                required: requirement.num_workers,
                assigned: filled,
            });
        }
    }

    outcome
}
