//! Per-zone conflict resolution and capacity accounting.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::model::{LoadSheddingSchedule, ShedReason};

/// How overlapping non-grid schedules on one zone coexist.
///
/// Grid-event schedules always stack with each other regardless of policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// One winner per zone; every overlapping lower-precedence schedule is superseded.
    #[default]
    Exclusive,
    /// Schedules stack while the zone total stays within capacity.
    Stacking,
}

impl ConflictPolicy {
    /// Whether `a` and `b` may be ACTIVE on the same zone at once.
    pub fn coexist(self, a: &LoadSheddingSchedule, b: &LoadSheddingSchedule) -> bool {
        let both_grid = a.reason == ShedReason::GridEvent && b.reason == ShedReason::GridEvent;
        both_grid || self == Self::Stacking
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub admitted: Vec<Uuid>,
    pub superseded: Vec<Uuid>,
}

/// Picks which candidates may be ACTIVE together on one zone.
///
/// Candidates are considered in precedence order; each one is admitted only
/// if it coexists with everything already admitted and the running total
/// stays within `capacity_kw`. Grid events are always admitted.
pub fn resolve(
    candidates: &[&LoadSheddingSchedule],
    capacity_kw: f64,
    policy: ConflictPolicy,
) -> Resolution {
    let mut ordered: Vec<&LoadSheddingSchedule> = candidates.to_vec();
    ordered.sort_by_key(|s| s.precedence());

    let mut admitted: Vec<&LoadSheddingSchedule> = Vec::new();
    let mut resolution = Resolution::default();
    let mut total = 0.0;

    for candidate in ordered {
        let fits = total + candidate.target_reduction_kw <= capacity_kw + 1e-9;
        let coexists = admitted.iter().all(|a| {
            !a.overlaps(candidate.start_time, candidate.end_time) || policy.coexist(a, candidate)
        });
        if candidate.reason == ShedReason::GridEvent || (coexists && fits) {
            total += candidate.target_reduction_kw;
            admitted.push(candidate);
            resolution.admitted.push(candidate.id);
        } else {
            resolution.superseded.push(candidate.id);
        }
    }
    resolution
}

/// Highest simultaneous reduction committed by `schedules` inside `[start, end)`.
pub fn peak_overlap_kw<'a>(
    schedules: impl IntoIterator<Item = &'a LoadSheddingSchedule>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> f64 {
    let relevant: Vec<&LoadSheddingSchedule> = schedules
        .into_iter()
        .filter(|s| s.overlaps(start, end))
        .collect();

    let mut points = vec![start];
    points.extend(
        relevant
            .iter()
            .map(|s| s.start_time)
            .filter(|t| *t > start && *t < end),
    );

    points
        .into_iter()
        .map(|t| {
            relevant
                .iter()
                .filter(|s| s.start_time <= t && t < s.end_time)
                .map(|s| s.target_reduction_kw)
                .sum::<f64>()
        })
        .fold(0.0, f64::max)
}
