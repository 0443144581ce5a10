//! Shared test fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeDelta, TimeZone, Utc};

use canopy_dr::baseline::BaselineEstimator;
use canopy_dr::clock::ManualClock;
use canopy_dr::dedup::InMemoryDedup;
use canopy_dr::model::{
    CropProfile, EnergyReading, EnvironmentSample, Facility, Zone, ZoneState, ZoneThermal,
};
use canopy_dr::ports::{
    AckMode, InMemoryStore, RecordingActuator, RecordingAlerter, StaticSensorFeed,
};
use canopy_dr::rates::{RateSchedule, RateWindow};
use canopy_dr::retry::RetryPolicy;
use canopy_dr::safety::SafetyEnvelope;
use canopy_dr::scheduler::{Collaborators, ControlPlane, ControlSettings, LoopSettings};
use canopy_dr::verification::{SavingsEngine, VerificationSettings};

pub const FACILITY: &str = "greenhouse-1";

/// 1 June 2026 (a Monday) plus `day - 1` days, UTC.
pub fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
        + TimeDelta::days(i64::from(day) - 1)
        + TimeDelta::hours(i64::from(hour))
        + TimeDelta::minutes(i64::from(minute))
}

pub fn lettuce() -> CropProfile {
    CropProfile::new("lettuce", "vegetative")
}

/// Wide envelope: a nominal sample stays safe for multi-hour sheds.
pub fn lettuce_envelope() -> SafetyEnvelope {
    SafetyEnvelope {
        min_temp_c: 15.0,
        max_temp_c: 30.0,
        min_humidity_pct: 40.0,
        max_humidity_pct: 90.0,
        min_dli: 10.0,
        max_continuous_dark_hours: 12.0,
    }
}

pub fn facility() -> Facility {
    Facility {
        id: FACILITY.to_string(),
        timezone: "UTC".to_string(),
        rate_zone: "front-range".to_string(),
        emissions_region: Some("wecc".to_string()),
    }
}

pub fn zone(id: &str, capacity_kw: f64) -> Zone {
    Zone {
        id: id.to_string(),
        facility_id: FACILITY.to_string(),
        capacity_kw,
        lighting_kw: capacity_kw * 0.8,
        crop_profile: lettuce(),
        thermal: ZoneThermal::default(),
        state: ZoneState::Normal,
    }
}

/// Off-peak $0.12 all day, peak 16:00-21:00 at $0.45, $10/kW demand charge.
pub fn peak_tariff() -> RateSchedule {
    let hm = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap();
    RateSchedule {
        rate_zone: "front-range".to_string(),
        version: 1,
        effective_from: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        effective_to: None,
        windows: vec![
            RateWindow {
                start: hm(0),
                end: hm(0),
                days_of_week: None,
                energy_rate: 0.12,
                is_peak: false,
            },
            RateWindow {
                start: hm(16),
                end: hm(21),
                days_of_week: None,
                energy_rate: 0.45,
                is_peak: true,
            },
        ],
        demand_charge_per_kw: 10.0,
    }
}

/// Mid-envelope conditions, lit, observed at `now`.
pub fn nominal_sample(zone_id: &str, now: DateTime<Utc>) -> EnvironmentSample {
    EnvironmentSample {
        zone_id: zone_id.to_string(),
        observed_at: now,
        temp_c: 22.0,
        humidity_pct: 60.0,
        dli_today: 12.0,
        planned_dli_remaining: 8.0,
        dark_hours: 0.0,
        lights_on: true,
    }
}

/// Hourly main-meter readings on `day` from `from` to `to` (inclusive) at a flat `kw`.
pub fn flat_readings(day: u32, from: u32, to: u32, kw: f64) -> Vec<EnergyReading> {
    (from..=to)
        .map(|h| EnergyReading {
            facility_id: FACILITY.to_string(),
            zone_id: None,
            timestamp: at(day, h, 0),
            power_kw: kw,
            cumulative_kwh: f64::from(h - from) * kw,
            cost: 0.0,
        })
        .collect()
}

/// A running control plane over in-memory collaborators and a manual clock.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub actuator: Arc<RecordingActuator>,
    pub sensors: Arc<StaticSensorFeed>,
    pub alerter: Arc<RecordingAlerter>,
    pub clock: Arc<ManualClock>,
    pub savings: Arc<SavingsEngine>,
    pub plane: ControlPlane,
}

impl Harness {
    /// Moves the clock, refreshes every listed zone's sample and runs one tick.
    pub async fn tick_at(&self, now: DateTime<Utc>, healthy_zones: &[&str]) {
        self.clock.set(now);
        for zone_id in healthy_zones {
            self.sensors.set(nominal_sample(zone_id, now));
        }
        self.plane.tick_all().await.unwrap();
    }
}

/// Seeds the store with one facility, the given zones and the peak tariff.
pub fn seeded_store(zones: &[(&str, f64)]) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.insert_facility(facility());
    for (id, capacity) in zones {
        store.insert_zone(zone(id, *capacity));
    }
    store.set_envelope(lettuce(), lettuce_envelope());
    store.publish_rate_schedule(peak_tariff());
    store
}

pub async fn harness_with(
    store: Arc<InMemoryStore>,
    start: DateTime<Utc>,
    settings: ControlSettings,
) -> Harness {
    let clock = Arc::new(ManualClock::new(start));
    let actuator = Arc::new(RecordingActuator::new(AckMode::Immediate));
    let sensors = Arc::new(StaticSensorFeed::new());
    let alerter = Arc::new(RecordingAlerter::new());
    let savings = Arc::new(SavingsEngine::new(
        store.clone(),
        clock.clone(),
        BaselineEstimator::default(),
        VerificationSettings::default(),
        RetryPolicy::default(),
    ));
    let deps = Collaborators {
        store: store.clone(),
        actuator: actuator.clone(),
        sensors: sensors.clone(),
        alerter: alerter.clone(),
        clock: clock.clone(),
        dedup: Arc::new(InMemoryDedup::new(TimeDelta::hours(24), 128)),
        savings: savings.clone(),
    };
    let plane = ControlPlane::start(deps, settings).await.unwrap();
    Harness {
        store,
        actuator,
        sensors,
        alerter,
        clock,
        savings,
        plane,
    }
}

/// Hour-long timer ticks, so tests drive the loop with explicit ticks.
pub fn manual_settings() -> ControlSettings {
    ControlSettings {
        timing: LoopSettings {
            tick_interval: Duration::from_secs(3_600),
            ..LoopSettings::default()
        },
        ..ControlSettings::default()
    }
}

pub async fn harness(zones: &[(&str, f64)], start: DateTime<Utc>) -> Harness {
    harness_with(seeded_store(zones), start, manual_settings()).await
}
