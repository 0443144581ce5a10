use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::EnvironmentSample;

/// Environmental dimension a safety check can fail on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyDimension {
    Temperature,
    Humidity,
    DailyLightIntegral,
    Darkness,
    /// No usable sample; the zone state is unknown.
    SensorData,
}

impl fmt::Display for SafetyDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::DailyLightIntegral => "daily light integral",
            Self::Darkness => "continuous darkness",
            Self::SensorData => "sensor data",
        };
        f.write_str(s)
    }
}

/// Crop-safety bounds for one crop and growth stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SafetyEnvelope {
    pub min_temp_c: f64,
    pub max_temp_c: f64,
    pub min_humidity_pct: f64,
    pub max_humidity_pct: f64,
    /// Minimum daily light integral (mol/m²/day).
    pub min_dli: f64,
    pub max_continuous_dark_hours: f64,
}

impl SafetyEnvelope {
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a lower bound exceeds its upper bound
    /// or a limit is negative.
    pub fn validate(&self) -> Result<()> {
        if self.min_temp_c >= self.max_temp_c {
            return Err(Error::Configuration(
                "safety envelope minTempC must be below maxTempC".to_string(),
            ));
        }
        if self.min_humidity_pct >= self.max_humidity_pct {
            return Err(Error::Configuration(
                "safety envelope minHumidityPct must be below maxHumidityPct".to_string(),
            ));
        }
        if self.min_dli < 0.0 || self.max_continuous_dark_hours < 0.0 {
            return Err(Error::Configuration(
                "safety envelope minDli and maxContinuousDarkHours must be >= 0".to_string(),
            ));
        }
        Ok(())
    }

    /// First dimension on which `sample` is already outside the envelope.
    pub fn violation(&self, sample: &EnvironmentSample) -> Option<SafetyDimension> {
        if sample.temp_c < self.min_temp_c || sample.temp_c > self.max_temp_c {
            Some(SafetyDimension::Temperature)
        } else if sample.humidity_pct < self.min_humidity_pct
            || sample.humidity_pct > self.max_humidity_pct
        {
            Some(SafetyDimension::Humidity)
        } else if sample.dli_today + sample.planned_dli_remaining < self.min_dli {
            Some(SafetyDimension::DailyLightIntegral)
        } else if sample.dark_hours > self.max_continuous_dark_hours {
            Some(SafetyDimension::Darkness)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn lettuce() -> SafetyEnvelope {
        SafetyEnvelope {
            min_temp_c: 16.0,
            max_temp_c: 26.0,
            min_humidity_pct: 50.0,
            max_humidity_pct: 80.0,
            min_dli: 14.0,
            max_continuous_dark_hours: 8.0,
        }
    }

    fn sample(temp_c: f64, humidity_pct: f64) -> EnvironmentSample {
        EnvironmentSample {
            zone_id: "veg-1".to_string(),
            observed_at: Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(),
            temp_c,
            humidity_pct,
            dli_today: 8.0,
            planned_dli_remaining: 10.0,
            dark_hours: 0.0,
            lights_on: true,
        }
    }

    #[test]
    fn inside_envelope_has_no_violation() {
        assert_eq!(lettuce().violation(&sample(22.0, 65.0)), None);
    }

    #[test]
    fn reports_out_of_range_dimension() {
        assert_eq!(
            lettuce().violation(&sample(27.5, 65.0)),
            Some(SafetyDimension::Temperature)
        );
        assert_eq!(
            lettuce().violation(&sample(22.0, 85.0)),
            Some(SafetyDimension::Humidity)
        );
    }

    #[test]
    fn inverted_bounds_fail_validation() {
        let mut env = lettuce();
        assert!(env.validate().is_ok());
        env.min_temp_c = 30.0;
        assert!(matches!(env.validate(), Err(Error::Configuration(_))));
    }
}
