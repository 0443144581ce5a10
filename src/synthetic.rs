//! Seeded synthetic meter history for the demo binary and tests.
//!
//! Each zone draws its HVAC base load all day and its lighting load during
//! the photoperiod, with Gaussian noise on top.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::clock::Clock;
use crate::model::{EnergyReading, EnvironmentSample, Zone, ZoneId};
use crate::ports::{SensorFeed, StoreError};
use crate::rates::RateBook;
use crate::safety::SafetyEnvelope;

#[derive(Debug, Clone)]
pub struct SyntheticProfile {
    /// Share of the non-lighting load drawn continuously by HVAC and fans.
    pub hvac_share: f64,
    /// Local hour the lights switch on.
    pub lights_on_hour: u32,
    /// Photoperiod length in hours.
    pub photoperiod_hours: u32,
    /// Standard deviation of the noise as a fraction of zone capacity.
    pub noise_fraction: f64,
    pub interval: TimeDelta,
}

impl Default for SyntheticProfile {
    fn default() -> Self {
        Self {
            hvac_share: 0.6,
            lights_on_hour: 6,
            photoperiod_hours: 16,
            noise_fraction: 0.02,
            interval: TimeDelta::hours(1),
        }
    }
}

/// Standard normal sample via Box-Muller.
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().clamp(1e-9, 1.0);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Generates per-zone readings from `start` (inclusive) to `end` (inclusive).
///
/// # Arguments
///
/// * `zones` - Zones of one facility
/// * `tz` - Facility timezone; the photoperiod is in local time
/// * `rates` - Tariff used to price each interval; `None` leaves `cost` at zero
/// * `seed` - Random seed; identical inputs and seed give identical readings
///
/// # Returns
///
/// Readings ordered by zone then timestamp, with a monotonic register per zone.
pub fn generate(
    zones: &[Zone],
    tz: Tz,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    profile: &SyntheticProfile,
    rates: Option<&RateBook>,
    seed: u64,
) -> Vec<EnergyReading> {
    let mut rng = StdRng::seed_from_u64(seed);
    let step_hours = profile.interval.num_seconds() as f64 / 3600.0;
    let mut out = Vec::new();
    if step_hours <= 0.0 {
        return out;
    }

    for zone in zones {
        let hvac_kw = (zone.capacity_kw - zone.lighting_kw).max(0.0) * profile.hvac_share;
        let mut register = 0.0;
        let mut previous_kw: Option<f64> = None;
        let mut t = start;
        while t <= end {
            let hour = t.with_timezone(&tz).hour();
            let since_on = (hour + 24 - profile.lights_on_hour) % 24;
            let lit = since_on < profile.photoperiod_hours;
            let mut kw = hvac_kw + if lit { zone.lighting_kw } else { 0.0 };
            if profile.noise_fraction > 0.0 {
                kw += gaussian(&mut rng) * profile.noise_fraction * zone.capacity_kw;
            }
            let kw = kw.clamp(0.0, zone.capacity_kw);

            // the interval ending at `t` is billed at the rate of its start
            let mut cost = 0.0;
            if let Some(prev) = previous_kw {
                let kwh = prev * step_hours;
                register += kwh;
                if let Some(book) = rates {
                    cost = kwh * book.rate_or_fallback(t - profile.interval, 0.0).energy_rate;
                }
            }

            out.push(EnergyReading {
                facility_id: zone.facility_id.clone(),
                zone_id: Some(zone.id.clone()),
                timestamp: t,
                power_kw: kw,
                cumulative_kwh: register,
                cost,
            });
            previous_kw = Some(kw);
            t += profile.interval;
        }
    }
    out
}

/// Sensor feed reporting each zone sitting mid-envelope, stamped with the
/// current clock time. Stands in for a real feed in demo mode.
pub struct SyntheticSensorFeed {
    clock: Arc<dyn Clock>,
    nominal: HashMap<ZoneId, EnvironmentSample>,
}

impl SyntheticSensorFeed {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            nominal: HashMap::new(),
        }
    }

    /// Registers a zone at the middle of its envelope, lit, with 60% of the
    /// minimum DLI already delivered and the same amount still planned.
    pub fn add_zone(&mut self, zone_id: impl Into<ZoneId>, envelope: &SafetyEnvelope) {
        let zone_id = zone_id.into();
        let sample = EnvironmentSample {
            zone_id: zone_id.clone(),
            observed_at: self.clock.now(),
            temp_c: (envelope.min_temp_c + envelope.max_temp_c) / 2.0,
            humidity_pct: (envelope.min_humidity_pct + envelope.max_humidity_pct) / 2.0,
            dli_today: envelope.min_dli * 0.6,
            planned_dli_remaining: envelope.min_dli * 0.6,
            dark_hours: 0.0,
            lights_on: true,
        };
        self.nominal.insert(zone_id, sample);
    }
}

#[async_trait]
impl SensorFeed for SyntheticSensorFeed {
    async fn latest(&self, zone_id: &str) -> Result<Option<EnvironmentSample>, StoreError> {
        Ok(self.nominal.get(zone_id).map(|s| EnvironmentSample {
            observed_at: self.clock.now(),
            ..s.clone()
        }))
    }
}
