//! Time-series inputs: metered energy, environment samples, non-routine events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::facility::{FacilityId, ZoneId};

/// Immutable meter reading. A reading without `zone_id` comes from the
/// facility main meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyReading {
    pub facility_id: FacilityId,
    #[serde(default)]
    pub zone_id: Option<ZoneId>,
    pub timestamp: DateTime<Utc>,
    /// Instantaneous demand (kW).
    pub power_kw: f64,
    /// Meter register (kWh).
    pub cumulative_kwh: f64,
    /// Billed cost attributed to the reading interval.
    #[serde(default)]
    pub cost: f64,
}

/// Latest environmental conditions of a zone, from the sensor feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSample {
    pub zone_id: ZoneId,
    pub observed_at: DateTime<Utc>,
    pub temp_c: f64,
    pub humidity_pct: f64,
    /// Light integral delivered so far today (mol/m²).
    pub dli_today: f64,
    /// Light integral still planned for today's photoperiod (mol/m²).
    pub planned_dli_remaining: f64,
    /// Hours the zone has been continuously dark (0 when lit).
    pub dark_hours: f64,
    pub lights_on: bool,
}

/// Registered change that makes pre-event history non-comparable, e.g. a
/// crop-stage change. History before `effective_from` is scaled by
/// `load_factor` when it stands in for periods after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NonRoutineEvent {
    pub facility_id: FacilityId,
    #[serde(default)]
    pub zone_id: Option<ZoneId>,
    pub effective_from: DateTime<Utc>,
    pub load_factor: f64,
    #[serde(default)]
    pub description: String,
}

impl NonRoutineEvent {
    /// Whether this event applies to readings of `zone` (facility-wide events apply to all).
    pub fn applies_to(&self, zone: Option<&str>) -> bool {
        match (&self.zone_id, zone) {
            (None, _) => true,
            (Some(own), Some(z)) => own == z,
            (Some(_), None) => false,
        }
    }
}
