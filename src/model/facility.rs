//! Facilities, zones and the per-zone physical parameters.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type FacilityId = String;
pub type ZoneId = String;

/// A grow facility: the shard key for control loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Facility {
    pub id: FacilityId,
    /// IANA timezone name, e.g. `"America/Denver"`.
    pub timezone: String,
    /// Utility rate-zone whose tariff applies to this site.
    pub rate_zone: String,
    /// Grid region used to look up the emissions factor.
    #[serde(default)]
    pub emissions_region: Option<String>,
}

impl Facility {
    /// Parses the facility timezone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unknown timezone name.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|_| {
            Error::Configuration(format!(
                "facility {} has unknown timezone \"{}\"",
                self.id, self.timezone
            ))
        })
    }
}

/// Crop and growth stage; selects the zone's safety envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CropProfile {
    pub crop: String,
    pub stage: String,
}

impl CropProfile {
    pub fn new(crop: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            crop: crop.into(),
            stage: stage.into(),
        }
    }
}

/// Environmental response of a zone to load changes.
///
/// Drift rates are signed and scale linearly with the shed magnitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ZoneThermal {
    /// Temperature change per hour per kW of HVAC reduction (°C).
    pub hvac_drift_c_per_kw_hour: f64,
    /// Relative humidity change per hour per kW of HVAC reduction (%).
    pub humidity_drift_pct_per_kw_hour: f64,
    /// Temperature change per hour per kW of lighting reduction (°C, usually negative).
    pub light_heat_c_per_kw_hour: f64,
    /// Daily light integral delivered per kWh of lighting (mol/m²).
    pub dli_per_kwh: f64,
    /// Rate at which the zone recovers temperature once a shed ends (°C/h).
    pub recovery_c_per_hour: f64,
    /// Rate at which a DLI deficit can be made up once lights return (mol/m²/h).
    pub recovery_dli_per_hour: f64,
}

impl Default for ZoneThermal {
    fn default() -> Self {
        Self {
            hvac_drift_c_per_kw_hour: 0.02,
            humidity_drift_pct_per_kw_hour: 0.05,
            light_heat_c_per_kw_hour: -0.01,
            dli_per_kwh: 0.02,
            recovery_c_per_hour: 2.0,
            recovery_dli_per_hour: 2.5,
        }
    }
}

/// Actuation state of a zone, owned by the facility control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneState {
    #[default]
    Normal,
    Shed,
    Shifted,
}

/// A controllable area inside a facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Zone {
    pub id: ZoneId,
    pub facility_id: FacilityId,
    /// Controllable (sheddable) load in kW.
    pub capacity_kw: f64,
    /// Installed lighting load; a shed at or above this darkens the zone.
    #[serde(default)]
    pub lighting_kw: f64,
    pub crop_profile: CropProfile,
    #[serde(default)]
    pub thermal: ZoneThermal,
    #[serde(default)]
    pub state: ZoneState,
}
