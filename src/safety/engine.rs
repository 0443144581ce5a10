use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use super::envelope::{SafetyDimension, SafetyEnvelope};
use crate::model::{ActionKind, EnvironmentSample, Zone};

/// A proposed (or running) shed, as seen by the safety check.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyAction {
    pub kind: ActionKind,
    pub magnitude_kw: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyVerdict {
    pub safe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<SafetyDimension>,
    /// How long the action could run before the first breach; `None` when
    /// no dimension ever breaches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_safe_duration_minutes: Option<f64>,
    /// Time the zone needs to return from the projected deviation.
    pub recovery_minutes: f64,
}

impl SafetyVerdict {
    fn unsafe_now(dimension: SafetyDimension, reason: String, recovery_minutes: f64) -> Self {
        Self {
            safe: false,
            reason: Some(reason),
            dimension: Some(dimension),
            max_safe_duration_minutes: Some(0.0),
            recovery_minutes,
        }
    }
}

/// Hours until one dimension leaves the envelope, plus the rate it drifts at.
#[derive(Debug, Clone, Copy)]
struct Projection {
    dimension: SafetyDimension,
    breach_hours: f64,
    /// Recovery time per hour of exposure (minutes).
    recovery_per_hour: f64,
}

/// Hours until `value` drifting at `rate`/h leaves `[min, max]`.
fn hours_to_leave(value: f64, rate: f64, min: f64, max: f64) -> f64 {
    if rate > 0.0 {
        (max - value) / rate
    } else if rate < 0.0 {
        (value - min) / -rate
    } else {
        f64::INFINITY
    }
}

/// Projects zone conditions under a shed and decides whether it is safe.
#[derive(Debug, Clone)]
pub struct SafetyEngine {
    max_sample_age: TimeDelta,
}

impl SafetyEngine {
    pub fn new(max_sample_age: TimeDelta) -> Self {
        Self { max_sample_age }
    }

    /// Checks `action` against the zone's envelope from the current sample.
    ///
    /// A missing or stale sample, or a zone already outside its envelope, is
    /// unsafe with zero safe duration. Otherwise each affected dimension is
    /// projected linearly and the earliest breach inside the action window
    /// makes the action unsafe.
    pub fn is_action_safe(
        &self,
        zone: &Zone,
        envelope: &SafetyEnvelope,
        sample: Option<&EnvironmentSample>,
        action: &SafetyAction,
        now: DateTime<Utc>,
    ) -> SafetyVerdict {
        let Some(sample) = sample else {
            return SafetyVerdict::unsafe_now(
                SafetyDimension::SensorData,
                format!("no environment sample for zone {}", zone.id),
                0.0,
            );
        };
        if now - sample.observed_at > self.max_sample_age {
            return SafetyVerdict::unsafe_now(
                SafetyDimension::SensorData,
                format!(
                    "environment sample for zone {} is stale (observed {})",
                    zone.id, sample.observed_at
                ),
                0.0,
            );
        }
        if let Some(dimension) = envelope.violation(sample) {
            let recovery = excursion_recovery_minutes(zone, envelope, sample);
            return SafetyVerdict::unsafe_now(
                dimension,
                format!("zone {} is already outside its {dimension} bounds", zone.id),
                recovery,
            );
        }

        let window_hours =
            (action.end - now.max(action.start)).num_seconds().max(0) as f64 / 3600.0;
        let projections = project(zone, envelope, sample, action);

        // most severe = earliest breach
        let worst = projections
            .iter()
            .copied()
            .min_by(|a, b| a.breach_hours.total_cmp(&b.breach_hours));

        let recovery_minutes = projections
            .iter()
            .map(|p| p.recovery_per_hour * p.breach_hours.min(window_hours))
            .fold(0.0, f64::max);

        match worst {
            Some(p) if p.breach_hours < window_hours => SafetyVerdict {
                safe: false,
                reason: Some(format!(
                    "{} would leave its {} bounds after {:.0} min of a {:.0} min shed",
                    zone.id,
                    p.dimension,
                    p.breach_hours * 60.0,
                    window_hours * 60.0
                )),
                dimension: Some(p.dimension),
                max_safe_duration_minutes: Some(p.breach_hours.max(0.0) * 60.0),
                recovery_minutes,
            },
            _ => SafetyVerdict {
                safe: true,
                reason: None,
                dimension: None,
                max_safe_duration_minutes: worst
                    .map(|p| p.breach_hours * 60.0)
                    .filter(|m| m.is_finite()),
                recovery_minutes,
            },
        }
    }
}

fn project(
    zone: &Zone,
    envelope: &SafetyEnvelope,
    sample: &EnvironmentSample,
    action: &SafetyAction,
) -> Vec<Projection> {
    let t = &zone.thermal;
    let kw = action.magnitude_kw.max(0.0);
    let lights_affected = matches!(action.kind, ActionKind::ReduceLight | ActionKind::Shift);
    let light_kw = if zone.lighting_kw > 0.0 {
        kw.min(zone.lighting_kw)
    } else {
        kw
    };
    let recovery_c = t.recovery_c_per_hour.max(f64::EPSILON);
    let recovery_dli = t.recovery_dli_per_hour.max(f64::EPSILON);

    let mut out = Vec::new();

    let temp_rate = match action.kind {
        ActionKind::ReduceHvac => t.hvac_drift_c_per_kw_hour * kw,
        ActionKind::ReduceLight | ActionKind::Shift if sample.lights_on => {
            t.light_heat_c_per_kw_hour * light_kw
        }
        _ => 0.0,
    };
    if temp_rate != 0.0 {
        out.push(Projection {
            dimension: SafetyDimension::Temperature,
            breach_hours: hours_to_leave(
                sample.temp_c,
                temp_rate,
                envelope.min_temp_c,
                envelope.max_temp_c,
            ),
            recovery_per_hour: temp_rate.abs() / recovery_c * 60.0,
        });
    }

    if action.kind == ActionKind::ReduceHvac {
        let rate = t.humidity_drift_pct_per_kw_hour * kw;
        if rate != 0.0 {
            out.push(Projection {
                dimension: SafetyDimension::Humidity,
                breach_hours: hours_to_leave(
                    sample.humidity_pct,
                    rate,
                    envelope.min_humidity_pct,
                    envelope.max_humidity_pct,
                ),
                recovery_per_hour: 0.0,
            });
        }
    }

    // Shift defers the light to later in the photoperiod: no deficit.
    if action.kind == ActionKind::ReduceLight && sample.lights_on {
        let deficit_rate = t.dli_per_kwh * light_kw;
        if deficit_rate > 0.0 {
            let margin = sample.dli_today + sample.planned_dli_remaining - envelope.min_dli;
            out.push(Projection {
                dimension: SafetyDimension::DailyLightIntegral,
                breach_hours: margin / deficit_rate,
                recovery_per_hour: deficit_rate / recovery_dli * 60.0,
            });
        }
    }

    let full_shed = zone.lighting_kw > 0.0 && kw >= zone.lighting_kw;
    if lights_affected && full_shed {
        let already_dark = if sample.lights_on { 0.0 } else { sample.dark_hours };
        out.push(Projection {
            dimension: SafetyDimension::Darkness,
            breach_hours: envelope.max_continuous_dark_hours - already_dark,
            recovery_per_hour: 0.0,
        });
    }

    out
}

/// Recovery time for a zone that is already outside its temperature or DLI bounds.
fn excursion_recovery_minutes(
    zone: &Zone,
    envelope: &SafetyEnvelope,
    sample: &EnvironmentSample,
) -> f64 {
    let t = &zone.thermal;
    let temp_excess = if sample.temp_c > envelope.max_temp_c {
        sample.temp_c - envelope.max_temp_c
    } else if sample.temp_c < envelope.min_temp_c {
        envelope.min_temp_c - sample.temp_c
    } else {
        0.0
    };
    let dli_deficit =
        (envelope.min_dli - sample.dli_today - sample.planned_dli_remaining).max(0.0);
    let temp_minutes = temp_excess / t.recovery_c_per_hour.max(f64::EPSILON) * 60.0;
    let dli_minutes = dli_deficit / t.recovery_dli_per_hour.max(f64::EPSILON) * 60.0;
    temp_minutes.max(dli_minutes)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::model::{CropProfile, ZoneState, ZoneThermal};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 15, 0, 0).unwrap()
    }

    fn zone() -> Zone {
        Zone {
            id: "flower-a".to_string(),
            facility_id: "f".to_string(),
            capacity_kw: 100.0,
            lighting_kw: 60.0,
            crop_profile: CropProfile::new("tomato", "flowering"),
            thermal: ZoneThermal::default(),
            state: ZoneState::Normal,
        }
    }

    fn envelope() -> SafetyEnvelope {
        SafetyEnvelope {
            min_temp_c: 18.0,
            max_temp_c: 28.0,
            min_humidity_pct: 50.0,
            max_humidity_pct: 85.0,
            min_dli: 20.0,
            max_continuous_dark_hours: 10.0,
        }
    }

    fn sample() -> EnvironmentSample {
        EnvironmentSample {
            zone_id: "flower-a".to_string(),
            observed_at: now() - TimeDelta::minutes(1),
            temp_c: 24.0,
            humidity_pct: 65.0,
            dli_today: 15.0,
            planned_dli_remaining: 10.0,
            dark_hours: 0.0,
            lights_on: true,
        }
    }

    fn action(kind: ActionKind, kw: f64, hours: i64) -> SafetyAction {
        SafetyAction {
            kind,
            magnitude_kw: kw,
            start: now(),
            end: now() + TimeDelta::hours(hours),
        }
    }

    fn engine() -> SafetyEngine {
        SafetyEngine::new(TimeDelta::minutes(10))
    }

    #[test]
    fn short_hvac_reduction_is_safe() {
        // 20 kW * 0.02 °C/kW/h = 0.4 °C/h; 4 °C of headroom = 10 h
        let v = engine().is_action_safe(
            &zone(),
            &envelope(),
            Some(&sample()),
            &action(ActionKind::ReduceHvac, 20.0, 2),
            now(),
        );
        assert!(v.safe, "{v:?}");
        assert!(v.max_safe_duration_minutes.unwrap() > 120.0);
        assert!(v.recovery_minutes > 0.0);
    }

    #[test]
    fn long_hvac_reduction_breaches_temperature() {
        // 100 kW * 0.02 = 2 °C/h; 4 °C of headroom = 2 h
        let v = engine().is_action_safe(
            &zone(),
            &envelope(),
            Some(&sample()),
            &action(ActionKind::ReduceHvac, 100.0, 3),
            now(),
        );
        assert!(!v.safe);
        assert_eq!(v.dimension, Some(SafetyDimension::Temperature));
        let max = v.max_safe_duration_minutes.unwrap();
        assert!((max - 120.0).abs() < 1e-6, "max safe {max}");
    }

    #[test]
    fn missing_or_stale_sample_is_unsafe() {
        let z = zone();
        let a = action(ActionKind::ReduceLight, 10.0, 1);
        let missing = engine().is_action_safe(&z, &envelope(), None, &a, now());
        assert!(!missing.safe);
        assert_eq!(missing.dimension, Some(SafetyDimension::SensorData));

        let mut old = sample();
        old.observed_at = now() - TimeDelta::hours(1);
        let stale = engine().is_action_safe(&z, &envelope(), Some(&old), &a, now());
        assert!(!stale.safe);
        assert_eq!(stale.max_safe_duration_minutes, Some(0.0));
    }

    #[test]
    fn zone_outside_envelope_is_unsafe_with_recovery() {
        let mut hot = sample();
        hot.temp_c = 30.0;
        let v = engine().is_action_safe(
            &zone(),
            &envelope(),
            Some(&hot),
            &action(ActionKind::ReduceHvac, 1.0, 1),
            now(),
        );
        assert!(!v.safe);
        assert_eq!(v.dimension, Some(SafetyDimension::Temperature));
        // 2 °C over at 2 °C/h
        assert!((v.recovery_minutes - 60.0).abs() < 1e-9);
    }

    #[test]
    fn light_shed_runs_down_dli_margin() {
        // margin 5 mol; 50 kW * 0.02 = 1 mol/h -> 5 h
        let v = engine().is_action_safe(
            &zone(),
            &envelope(),
            Some(&sample()),
            &action(ActionKind::ReduceLight, 50.0, 6),
            now(),
        );
        assert!(!v.safe);
        assert_eq!(v.dimension, Some(SafetyDimension::DailyLightIntegral));
    }

    #[test]
    fn shift_carries_no_dli_deficit() {
        let v = engine().is_action_safe(
            &zone(),
            &envelope(),
            Some(&sample()),
            &action(ActionKind::Shift, 50.0, 6),
            now(),
        );
        assert!(v.safe, "{v:?}");
    }

    #[test]
    fn full_light_shed_is_limited_by_darkness() {
        let mut dark = sample();
        dark.lights_on = false;
        dark.dark_hours = 9.0;
        let v = engine().is_action_safe(
            &zone(),
            &envelope(),
            Some(&dark),
            &action(ActionKind::Shift, 60.0, 2),
            now(),
        );
        assert!(!v.safe);
        assert_eq!(v.dimension, Some(SafetyDimension::Darkness));
        assert!((v.max_safe_duration_minutes.unwrap() - 60.0).abs() < 1e-9);
    }
}
