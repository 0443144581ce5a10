//! Proactive peak avoidance: plans low-priority sheds for upcoming tariff peaks.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::lifecycle::FacilityScheduler;
use crate::model::{ActionKind, Priority, ShedReason, ShedRequest, ZoneId};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerSettings {
    pub enabled: bool,
    /// Fraction of each zone's capacity shifted during peaks (0.0-1.0).
    pub shed_fraction: f64,
    /// How far ahead to look for peak windows.
    pub horizon_hours: u32,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            shed_fraction: 0.2,
            horizon_hours: 24,
        }
    }
}

/// Remembers which (zone, peak window) pairs were already planned so a
/// superseded or rejected plan is not re-proposed every tick.
#[derive(Debug, Default)]
pub struct CostOptimizer {
    settings: OptimizerSettings,
    planned: BTreeSet<(ZoneId, DateTime<Utc>)>,
}

impl CostOptimizer {
    pub fn new(settings: OptimizerSettings) -> Self {
        Self {
            settings,
            planned: BTreeSet::new(),
        }
    }

    /// Proposes one `cost_optimization` request per zone and upcoming peak
    /// window that has no open schedule yet.
    pub fn plan(&mut self, scheduler: &FacilityScheduler, now: DateTime<Utc>) -> Vec<ShedRequest> {
        if !self.settings.enabled {
            return Vec::new();
        }
        let horizon = TimeDelta::hours(i64::from(self.settings.horizon_hours));
        let windows = match scheduler
            .rates()
            .peak_windows(now, now + horizon, TimeDelta::minutes(15))
        {
            Ok(windows) => windows,
            Err(err) => {
                warn!(facility_id = %scheduler.facility().id, "skipping cost optimization: {err}");
                return Vec::new();
            }
        };

        // forget windows that are over
        self.planned.retain(|(_, end)| *end > now);

        let open = scheduler.open_schedules();
        let mut requests = Vec::new();
        for (start, end) in windows {
            for zone in scheduler.zones() {
                let key = (zone.id.clone(), end);
                if self.planned.contains(&key) || !scheduler.has_envelope(&zone.id) {
                    continue;
                }
                self.planned.insert(key);
                if open
                    .iter()
                    .any(|s| s.zone_id == zone.id && s.overlaps(start, end))
                {
                    continue;
                }
                let target = zone.capacity_kw * self.settings.shed_fraction.clamp(0.0, 1.0);
                match ShedRequest::new(
                    scheduler.facility().id.clone(),
                    zone.id.clone(),
                    start.max(now),
                    end,
                    target,
                    Priority::Low,
                    ShedReason::CostOptimization,
                    ActionKind::Shift,
                ) {
                    Ok(request) => requests.push(request),
                    Err(err) => debug!(zone_id = %zone.id, "no cost-optimization plan: {err}"),
                }
            }
        }
        requests
    }
}
