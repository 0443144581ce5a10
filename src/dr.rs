//! Demand-response events: split a facility-level reduction request into
//! per-zone priority-1 schedules.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    ActionKind, DemandResponseEvent, LoadSheddingSchedule, Priority, ShedReason, ShedRequest,
    ZoneId,
};
use crate::scheduler::{FacilityScheduler, TickOutcome};

/// Sheddable headroom of one zone for an event window.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneCapacity {
    pub zone_id: ZoneId,
    pub capacity_kw: f64,
    /// Capacity minus what other grid events already reserved in the window.
    pub spare_kw: f64,
}

/// Splits a required reduction over zones. Returns one share per input
/// zone, in input order; no share exceeds that zone's spare capacity.
pub trait AllocationStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn allocate(&self, required_kw: f64, zones: &[ZoneCapacity]) -> Vec<f64>;
}

/// Shares proportional to zone capacity; zones that hit their spare limit
/// are capped and the remainder is redistributed over the rest.
#[derive(Debug, Default, Clone, Copy)]
pub struct Proportional;

impl AllocationStrategy for Proportional {
    fn name(&self) -> &'static str {
        "proportional"
    }

    fn allocate(&self, required_kw: f64, zones: &[ZoneCapacity]) -> Vec<f64> {
        let mut shares = vec![0.0; zones.len()];
        let mut open: Vec<usize> = (0..zones.len())
            .filter(|&i| zones[i].spare_kw > 0.0 && zones[i].capacity_kw > 0.0)
            .collect();
        let total_spare: f64 = open.iter().map(|&i| zones[i].spare_kw).sum();
        let mut remaining = required_kw.min(total_spare).max(0.0);

        while remaining > 1e-9 && !open.is_empty() {
            let weight: f64 = open.iter().map(|&i| zones[i].capacity_kw).sum();
            let saturated: Vec<usize> = open
                .iter()
                .copied()
                .filter(|&i| remaining * zones[i].capacity_kw / weight >= zones[i].spare_kw)
                .collect();

            if saturated.is_empty() {
                for &i in &open {
                    shares[i] = remaining * zones[i].capacity_kw / weight;
                }
                break;
            }
            for &i in &saturated {
                shares[i] = zones[i].spare_kw;
                remaining -= zones[i].spare_kw;
            }
            open.retain(|i| !saturated.contains(i));
        }
        shares
    }
}

/// Fills the zones with the most spare capacity first.
#[derive(Debug, Default, Clone, Copy)]
pub struct LargestFirst;

impl AllocationStrategy for LargestFirst {
    fn name(&self) -> &'static str {
        "largest_first"
    }

    fn allocate(&self, required_kw: f64, zones: &[ZoneCapacity]) -> Vec<f64> {
        let mut order: Vec<usize> = (0..zones.len()).collect();
        order.sort_by(|&a, &b| {
            zones[b]
                .spare_kw
                .total_cmp(&zones[a].spare_kw)
                .then_with(|| zones[a].zone_id.cmp(&zones[b].zone_id))
        });

        let mut shares = vec![0.0; zones.len()];
        let mut remaining = required_kw.max(0.0);
        for i in order {
            if remaining <= 0.0 {
                break;
            }
            let take = zones[i].spare_kw.max(0.0).min(remaining);
            shares[i] = take;
            remaining -= take;
        }
        shares
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationKind {
    #[default]
    Proportional,
    LargestFirst,
}

impl AllocationKind {
    pub fn strategy(self) -> Arc<dyn AllocationStrategy> {
        match self {
            Self::Proportional => Arc::new(Proportional),
            Self::LargestFirst => Arc::new(LargestFirst),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DrSettings {
    pub allocation: AllocationKind,
    /// Physical action used for grid-event sheds.
    pub action: ActionKind,
}

impl Default for DrSettings {
    fn default() -> Self {
        Self {
            allocation: AllocationKind::Proportional,
            action: ActionKind::ReduceLight,
        }
    }
}

/// Outcome of handling one demand-response event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrAllocation {
    pub event_id: String,
    pub facility_id: String,
    pub strategy: String,
    pub schedules: Vec<LoadSheddingSchedule>,
    pub requested_kw: f64,
    pub achieved_kw: f64,
    /// Less spare capacity than requested; every spare kW was committed.
    pub partial_fulfillment: bool,
    /// This event id was already handled; the original allocation is returned.
    #[serde(default)]
    pub duplicate: bool,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DemandResponseHandler {
    strategy: Arc<dyn AllocationStrategy>,
    action: ActionKind,
}

impl Default for DemandResponseHandler {
    fn default() -> Self {
        Self::new(&DrSettings::default())
    }
}

impl DemandResponseHandler {
    pub fn new(settings: &DrSettings) -> Self {
        Self {
            strategy: settings.allocation.strategy(),
            action: settings.action,
        }
    }

    pub fn with_strategy(strategy: Arc<dyn AllocationStrategy>, action: ActionKind) -> Self {
        Self { strategy, action }
    }

    /// Spare capacity of every shed-capable zone over `[start, end)`.
    pub fn zone_capacities(
        scheduler: &FacilityScheduler,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<ZoneCapacity> {
        scheduler
            .zones()
            .filter(|z| scheduler.has_envelope(&z.id))
            .map(|z| ZoneCapacity {
                zone_id: z.id.clone(),
                capacity_kw: z.capacity_kw,
                spare_kw: (z.capacity_kw - scheduler.reserved_grid_kw(&z.id, start, end)).max(0.0),
            })
            .collect()
    }

    /// Allocates `event` over the facility's zones and creates the schedules.
    ///
    /// Schedules span `max(window_start, now)..window_end`. A shortfall is not
    /// an error: the allocation is flagged `partial_fulfillment`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if the event window has already ended and
    /// [`Error::NotFound`] if the event targets another facility.
    pub fn allocate(
        &self,
        scheduler: &mut FacilityScheduler,
        event: &DemandResponseEvent,
        now: DateTime<Utc>,
    ) -> Result<(DrAllocation, TickOutcome)> {
        if event.facility_id != scheduler.facility().id {
            return Err(Error::not_found("facility", event.facility_id.clone()));
        }
        if event.has_ended(now) {
            return Err(Error::InvalidRequest(format!(
                "demand-response event {} ended at {}",
                event.id, event.window_end
            )));
        }

        let start = event.window_start.max(now);
        let zones = Self::zone_capacities(scheduler, start, event.window_end);
        let shares = self.strategy.allocate(event.required_reduction_kw, &zones);

        let mut outcome = TickOutcome::default();
        let mut schedules = Vec::new();
        for (zone, share) in zones.iter().zip(shares) {
            if share <= 1e-9 {
                continue;
            }
            let request = ShedRequest::new(
                event.facility_id.clone(),
                zone.zone_id.clone(),
                start,
                event.window_end,
                share,
                Priority::High,
                ShedReason::GridEvent,
                self.action,
            )?
            .with_dr_event(event.id.clone());
            match scheduler.submit(request, Uuid::new_v4(), now) {
                Ok((schedule, effects)) => {
                    outcome.merge(effects);
                    schedules.push(schedule);
                }
                Err(err) => warn!(
                    zone_id = %zone.zone_id,
                    event_id = %event.id,
                    "zone share rejected: {err}"
                ),
            }
        }

        let achieved_kw: f64 = schedules.iter().map(|s| s.target_reduction_kw).sum();
        let partial_fulfillment = achieved_kw + 1e-6 < event.required_reduction_kw;
        info!(
            event_id = %event.id,
            facility_id = %event.facility_id,
            requested_kw = event.required_reduction_kw,
            achieved_kw,
            zones = schedules.len(),
            partial_fulfillment,
            "demand-response event allocated"
        );

        Ok((
            DrAllocation {
                event_id: event.id.clone(),
                facility_id: event.facility_id.clone(),
                strategy: self.strategy.name().to_string(),
                schedules,
                requested_kw: event.required_reduction_kw,
                achieved_kw,
                partial_fulfillment,
                duplicate: false,
                allocated_at: now,
            },
            outcome,
        ))
    }
}
