//! Site inventory: facilities, zones, crop safety envelopes, tariffs and
//! non-routine events, loaded from a TOML file separate from the service
//! configuration.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::Deserialize;
use tracing::info;

use crate::config::ConfigError;
use crate::model::{CropProfile, Facility, NonRoutineEvent, Zone, ZoneState, ZoneThermal};
use crate::ports::InMemoryStore;
use crate::rates::{RateSchedule, RateWindow};
use crate::safety::SafetyEnvelope;

/// Two zones, one tariff with an evening peak; used when no inventory is given.
pub const DEMO_SITE: &str = r#"
[[facility]]
id = "greenhouse-1"
timezone = "America/Denver"
rate_zone = "front-range"
emissions_region = "wecc"

[[zone]]
id = "flower-a"
facility = "greenhouse-1"
capacity_kw = 120.0
lighting_kw = 90.0
crop = "tomato"
stage = "fruiting"

[[zone]]
id = "veg-b"
facility = "greenhouse-1"
capacity_kw = 60.0
lighting_kw = 40.0
crop = "lettuce"
stage = "vegetative"

[[envelope]]
crop = "tomato"
stage = "fruiting"
min_temp_c = 16.0
max_temp_c = 29.0
min_humidity_pct = 50.0
max_humidity_pct = 85.0
min_dli = 20.0
max_continuous_dark_hours = 10.0

[[envelope]]
crop = "lettuce"
stage = "vegetative"
min_temp_c = 14.0
max_temp_c = 26.0
min_humidity_pct = 45.0
max_humidity_pct = 85.0
min_dli = 12.0
max_continuous_dark_hours = 8.0

[[rate_schedule]]
rate_zone = "front-range"
version = 1
effective_from = "2026-01-01T00:00:00Z"
demand_charge_per_kw = 12.0

[[rate_schedule.window]]
start = "00:00"
end = "00:00"
energy_rate = 0.12

[[rate_schedule.window]]
start = "16:00"
end = "21:00"
energy_rate = 0.45
is_peak = true
"#;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct InventoryFile {
    facility: Vec<FacilityEntry>,
    zone: Vec<ZoneEntry>,
    envelope: Vec<EnvelopeEntry>,
    rate_schedule: Vec<RateScheduleEntry>,
    non_routine_event: Vec<NonRoutineEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FacilityEntry {
    id: String,
    timezone: String,
    rate_zone: String,
    #[serde(default)]
    emissions_region: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ZoneEntry {
    id: String,
    facility: String,
    capacity_kw: f64,
    /// Defaults to the full capacity.
    #[serde(default)]
    lighting_kw: Option<f64>,
    crop: String,
    stage: String,
    #[serde(default)]
    thermal: Option<ThermalEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ThermalEntry {
    hvac_drift_c_per_kw_hour: f64,
    humidity_drift_pct_per_kw_hour: f64,
    light_heat_c_per_kw_hour: f64,
    dli_per_kwh: f64,
    recovery_c_per_hour: f64,
    recovery_dli_per_hour: f64,
}

impl Default for ThermalEntry {
    fn default() -> Self {
        let t = ZoneThermal::default();
        Self {
            hvac_drift_c_per_kw_hour: t.hvac_drift_c_per_kw_hour,
            humidity_drift_pct_per_kw_hour: t.humidity_drift_pct_per_kw_hour,
            light_heat_c_per_kw_hour: t.light_heat_c_per_kw_hour,
            dli_per_kwh: t.dli_per_kwh,
            recovery_c_per_hour: t.recovery_c_per_hour,
            recovery_dli_per_hour: t.recovery_dli_per_hour,
        }
    }
}

impl From<ThermalEntry> for ZoneThermal {
    fn from(t: ThermalEntry) -> Self {
        Self {
            hvac_drift_c_per_kw_hour: t.hvac_drift_c_per_kw_hour,
            humidity_drift_pct_per_kw_hour: t.humidity_drift_pct_per_kw_hour,
            light_heat_c_per_kw_hour: t.light_heat_c_per_kw_hour,
            dli_per_kwh: t.dli_per_kwh,
            recovery_c_per_hour: t.recovery_c_per_hour,
            recovery_dli_per_hour: t.recovery_dli_per_hour,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvelopeEntry {
    crop: String,
    stage: String,
    min_temp_c: f64,
    max_temp_c: f64,
    min_humidity_pct: f64,
    max_humidity_pct: f64,
    min_dli: f64,
    max_continuous_dark_hours: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RateScheduleEntry {
    rate_zone: String,
    version: u32,
    effective_from: DateTime<Utc>,
    #[serde(default)]
    effective_to: Option<DateTime<Utc>>,
    #[serde(default)]
    demand_charge_per_kw: f64,
    #[serde(default)]
    window: Vec<WindowEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WindowEntry {
    start: String,
    end: String,
    #[serde(default)]
    days_of_week: Option<Vec<Weekday>>,
    energy_rate: f64,
    #[serde(default)]
    is_peak: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NonRoutineEntry {
    facility: String,
    #[serde(default)]
    zone: Option<String>,
    effective_from: DateTime<Utc>,
    load_factor: f64,
    #[serde(default)]
    description: String,
}

fn parse_time(field: &str, raw: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|e| ConfigError {
            field: field.to_string(),
            message: format!("invalid time \"{raw}\": {e}"),
        })
}

/// Parsed site inventory.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub facilities: Vec<Facility>,
    pub zones: Vec<Zone>,
    pub envelopes: Vec<(CropProfile, SafetyEnvelope)>,
    pub rate_schedules: Vec<RateSchedule>,
    pub non_routine_events: Vec<NonRoutineEvent>,
}

impl Inventory {
    /// The built-in demo site.
    ///
    /// # Errors
    ///
    /// Only if [`DEMO_SITE`] itself is malformed.
    pub fn demo() -> Result<Self, ConfigError> {
        Self::from_toml_str(DEMO_SITE)
    }

    /// Parses an inventory from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            field: "inventory".to_string(),
            message: format!("cannot read \"{}\": {e}", path.display()),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses an inventory from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for invalid TOML, unknown fields or a
    /// malformed window time.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: InventoryFile = toml::from_str(s).map_err(|e| ConfigError {
            field: "toml".to_string(),
            message: e.to_string(),
        })?;

        let facilities = file
            .facility
            .into_iter()
            .map(|f| Facility {
                id: f.id,
                timezone: f.timezone,
                rate_zone: f.rate_zone,
                emissions_region: f.emissions_region,
            })
            .collect();

        let zones = file
            .zone
            .into_iter()
            .map(|z| Zone {
                lighting_kw: z.lighting_kw.unwrap_or(z.capacity_kw),
                id: z.id,
                facility_id: z.facility,
                capacity_kw: z.capacity_kw,
                crop_profile: CropProfile::new(z.crop, z.stage),
                thermal: z.thermal.unwrap_or_default().into(),
                state: ZoneState::Normal,
            })
            .collect();

        let envelopes = file
            .envelope
            .into_iter()
            .map(|e| {
                (
                    CropProfile::new(e.crop, e.stage),
                    SafetyEnvelope {
                        min_temp_c: e.min_temp_c,
                        max_temp_c: e.max_temp_c,
                        min_humidity_pct: e.min_humidity_pct,
                        max_humidity_pct: e.max_humidity_pct,
                        min_dli: e.min_dli,
                        max_continuous_dark_hours: e.max_continuous_dark_hours,
                    },
                )
            })
            .collect();

        let mut rate_schedules = Vec::new();
        for (i, r) in file.rate_schedule.into_iter().enumerate() {
            let mut windows = Vec::new();
            for (j, w) in r.window.into_iter().enumerate() {
                let field = format!("rate_schedule[{i}].window[{j}]");
                windows.push(RateWindow {
                    start: parse_time(&format!("{field}.start"), &w.start)?,
                    end: parse_time(&format!("{field}.end"), &w.end)?,
                    days_of_week: w.days_of_week,
                    energy_rate: w.energy_rate,
                    is_peak: w.is_peak,
                });
            }
            rate_schedules.push(RateSchedule {
                rate_zone: r.rate_zone,
                version: r.version,
                effective_from: r.effective_from,
                effective_to: r.effective_to,
                windows,
                demand_charge_per_kw: r.demand_charge_per_kw,
            });
        }

        let non_routine_events = file
            .non_routine_event
            .into_iter()
            .map(|e| NonRoutineEvent {
                facility_id: e.facility,
                zone_id: e.zone,
                effective_from: e.effective_from,
                load_factor: e.load_factor,
                description: e.description,
            })
            .collect();

        Ok(Self {
            facilities,
            zones,
            envelopes,
            rate_schedules,
            non_routine_events,
        })
    }

    /// Validates references and value ranges.
    ///
    /// Returns an empty vector if the inventory is consistent.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let err = |field: String, message: String| ConfigError { field, message };

        let mut facility_ids = BTreeSet::new();
        for (i, f) in self.facilities.iter().enumerate() {
            if !facility_ids.insert(f.id.as_str()) {
                errors.push(err(format!("facility[{i}].id"), format!("duplicate id \"{}\"", f.id)));
            }
            if let Err(e) = f.tz() {
                errors.push(err(format!("facility[{i}].timezone"), e.to_string()));
            }
        }

        let mut zone_ids = BTreeSet::new();
        for (i, z) in self.zones.iter().enumerate() {
            if !zone_ids.insert(z.id.as_str()) {
                errors.push(err(format!("zone[{i}].id"), format!("duplicate id \"{}\"", z.id)));
            }
            if !facility_ids.contains(z.facility_id.as_str()) {
                errors.push(err(
                    format!("zone[{i}].facility"),
                    format!("unknown facility \"{}\"", z.facility_id),
                ));
            }
            if !(z.capacity_kw.is_finite() && z.capacity_kw > 0.0) {
                errors.push(err(format!("zone[{i}].capacity_kw"), "must be > 0".to_string()));
            }
            if !(0.0..=z.capacity_kw).contains(&z.lighting_kw) {
                errors.push(err(
                    format!("zone[{i}].lighting_kw"),
                    "must be in [0, capacity_kw]".to_string(),
                ));
            }
        }

        for (i, (_, envelope)) in self.envelopes.iter().enumerate() {
            if let Err(e) = envelope.validate() {
                errors.push(err(format!("envelope[{i}]"), e.to_string()));
            }
        }

        for (i, schedule) in self.rate_schedules.iter().enumerate() {
            if let Err(e) = schedule.validate() {
                errors.push(err(format!("rate_schedule[{i}]"), e.to_string()));
            }
        }

        for (i, e) in self.non_routine_events.iter().enumerate() {
            if !facility_ids.contains(e.facility_id.as_str()) {
                errors.push(err(
                    format!("non_routine_event[{i}].facility"),
                    format!("unknown facility \"{}\"", e.facility_id),
                ));
            }
            if !(e.load_factor.is_finite() && e.load_factor > 0.0) {
                errors.push(err(
                    format!("non_routine_event[{i}].load_factor"),
                    "must be > 0".to_string(),
                ));
            }
        }

        errors
    }

    /// Loads everything into an in-memory store.
    pub fn seed(&self, store: &InMemoryStore) {
        for f in &self.facilities {
            store.insert_facility(f.clone());
        }
        for z in &self.zones {
            store.insert_zone(z.clone());
        }
        for (profile, envelope) in &self.envelopes {
            store.set_envelope(profile.clone(), envelope.clone());
        }
        for r in &self.rate_schedules {
            store.publish_rate_schedule(r.clone());
        }
        for e in &self.non_routine_events {
            store.add_non_routine_event(e.clone());
        }
        info!(
            facilities = self.facilities.len(),
            zones = self.zones.len(),
            envelopes = self.envelopes.len(),
            rate_schedules = self.rate_schedules.len(),
            "inventory loaded"
        );
    }
}
