//! Human-facing recommendations derived from the savings trend and schedule history.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::model::{CancelReason, LoadSheddingSchedule, SavingsReport, ScheduleStatus, ShedReason};
use crate::ports::Severity;

/// Safety cancellations per zone before the crop envelope is called out.
const SAFETY_CANCELLATION_THRESHOLD: usize = 3;
/// Consecutive reports needed to call a trend.
const TREND_REPORTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    ProvisionalBaseline,
    DecliningSavings,
    NegativePeakReduction,
    RepeatedSafetyCancellations,
    DegradedActuation,
    UnderusedDrCapacity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Info => "INFO",
            Severity::Warning => "WARN",
            Severity::Critical => "CRIT",
        };
        write!(f, "[{tag}] {}", self.message)
    }
}

/// Derives recommendations for one facility.
///
/// # Arguments
///
/// * `reports` - Cached savings reports, newest first
/// * `schedules` - Schedule history of the facility, any status
///
/// # Returns
///
/// Recommendations ordered most severe first.
pub fn recommendations(
    reports: &[SavingsReport],
    schedules: &[LoadSheddingSchedule],
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    if let Some(latest) = reports.first() {
        if latest.low_confidence {
            out.push(Recommendation {
                kind: RecommendationKind::ProvisionalBaseline,
                severity: Severity::Info,
                message: format!(
                    "Savings for {} .. {} are provisional: fewer than the required comparable days of metered history. Keep meter data flowing to firm up the baseline.",
                    latest.period_start, latest.period_end
                ),
            });
        }
        if latest.peak_reduction_kw < 0.0 {
            out.push(Recommendation {
                kind: RecommendationKind::NegativePeakReduction,
                severity: Severity::Warning,
                message: format!(
                    "Peak demand rose {:.1} kW above baseline in the latest period. Check for rebound after sheds end or shift restores away from peak hours.",
                    -latest.peak_reduction_kw
                ),
            });
        }
    }

    if reports.len() >= TREND_REPORTS {
        // newest first, so a decline means each report saved less than the one before it
        let recent = &reports[..TREND_REPORTS];
        if recent.windows(2).all(|w| w[0].kwh_saved < w[1].kwh_saved) {
            out.push(Recommendation {
                kind: RecommendationKind::DecliningSavings,
                severity: Severity::Warning,
                message: format!(
                    "Energy savings have declined over the last {TREND_REPORTS} reports ({:.1} -> {:.1} kWh). Review shed targets and zone participation.",
                    recent[TREND_REPORTS - 1].kwh_saved,
                    recent[0].kwh_saved
                ),
            });
        }
    }

    let mut safety_cancellations: BTreeMap<&str, usize> = BTreeMap::new();
    let mut degraded: BTreeMap<&str, usize> = BTreeMap::new();
    for s in schedules {
        if matches!(
            s.cancel_reason,
            Some(CancelReason::SafetyViolation | CancelReason::SafetyTimeout)
        ) {
            *safety_cancellations.entry(&s.zone_id).or_default() += 1;
        }
        if s.degraded {
            *degraded.entry(&s.zone_id).or_default() += 1;
        }
    }

    for (zone_id, count) in safety_cancellations {
        if count >= SAFETY_CANCELLATION_THRESHOLD {
            out.push(Recommendation {
                kind: RecommendationKind::RepeatedSafetyCancellations,
                severity: Severity::Warning,
                message: format!(
                    "Zone {zone_id} had {count} sheds cancelled by the crop safety envelope. Lower its shed targets or shorten shed windows."
                ),
            });
        }
    }

    for (zone_id, count) in degraded {
        out.push(Recommendation {
            kind: RecommendationKind::DegradedActuation,
            severity: Severity::Critical,
            message: format!(
                "Zone {zone_id} did not acknowledge {count} shed command(s). Inspect the device controller; reported savings may overstate the shed."
            ),
        });
    }

    let completed_sheds = schedules
        .iter()
        .filter(|s| s.status == ScheduleStatus::Completed)
        .count();
    let grid_events = schedules
        .iter()
        .filter(|s| s.reason == ShedReason::GridEvent)
        .count();
    if completed_sheds > 0 && grid_events == 0 {
        out.push(Recommendation {
            kind: RecommendationKind::UnderusedDrCapacity,
            severity: Severity::Info,
            message: format!(
                "The facility completed {completed_sheds} shed(s) but has not taken part in any demand-response event. Its shed capacity could earn DR compensation."
            ),
        });
    }

    out.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.kind.cmp(&b.kind)));
    out
}
