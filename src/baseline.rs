//! Counterfactual consumption baseline ("what would have been used without
//! intervention") built from metered history.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{BaselineMethod, EnergyReading, NonRoutineEvent};

/// Baseline tuning, loaded from the `[baseline]` config section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BaselineSettings {
    /// Bucket width in minutes; must divide a day evenly.
    pub interval_minutes: u32,
    /// Same-weekday weeks averaged for each bucket.
    pub lookback_weeks: u32,
    /// Below this many comparable days the flat fallback is used.
    pub min_comparable_days: u32,
    /// Days averaged by the flat fallback.
    pub fallback_days: u32,
}

impl Default for BaselineSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            lookback_weeks: 4,
            min_comparable_days: 3,
            fallback_days: 7,
        }
    }
}

impl BaselineSettings {
    pub fn interval(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.interval_minutes.max(1)))
    }

    fn buckets_per_day(&self) -> f64 {
        f64::from(24 * 60 / self.interval_minutes.max(1))
    }

    /// Earliest reading the estimator can use for a period starting at `period_start`.
    pub fn history_start(&self, period_start: DateTime<Utc>) -> DateTime<Utc> {
        let lookback = TimeDelta::weeks(i64::from(self.lookback_weeks));
        let fallback = TimeDelta::days(i64::from(self.fallback_days));
        // one extra day so DST shifts near the edge still find their bucket
        period_start - lookback.max(fallback) - TimeDelta::days(1)
    }
}

/// Energy and demand metered in one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketUsage {
    pub kwh: f64,
    pub peak_kw: f64,
    /// Register deltas attributed to the bucket; zero for demand-only buckets.
    pub intervals: u32,
}

/// Floors `at` to the bucket grid.
pub fn bucket_start(at: DateTime<Utc>, interval: TimeDelta) -> DateTime<Utc> {
    let step = interval.num_seconds().max(1);
    let ts = at.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(step), 0).unwrap_or(at)
}

/// Buckets metered readings into per-interval energy and peak demand.
///
/// Energy comes from consecutive register deltas of each meter, attributed
/// to the bucket of the earlier reading; a register that goes backwards
/// (meter swap) contributes nothing. For `zone = None` the facility main
/// meter is used when present, otherwise the zone meters are summed.
pub fn meter_usage(
    readings: &[EnergyReading],
    zone: Option<&str>,
    interval: TimeDelta,
) -> BTreeMap<DateTime<Utc>, BucketUsage> {
    let has_main = readings.iter().any(|r| r.zone_id.is_none());
    let selected = readings.iter().filter(|r| match zone {
        Some(z) => r.zone_id.as_deref() == Some(z),
        None => !has_main || r.zone_id.is_none(),
    });

    let mut meters: BTreeMap<Option<&str>, Vec<&EnergyReading>> = BTreeMap::new();
    for r in selected {
        meters.entry(r.zone_id.as_deref()).or_default().push(r);
    }

    let mut usage: BTreeMap<DateTime<Utc>, BucketUsage> = BTreeMap::new();
    for series in meters.values_mut() {
        series.sort_by_key(|r| r.timestamp);

        let mut meter_peak: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();
        for r in series.iter() {
            let peak = meter_peak
                .entry(bucket_start(r.timestamp, interval))
                .or_insert(0.0);
            *peak = peak.max(r.power_kw);
        }
        for pair in series.windows(2) {
            let delta = (pair[1].cumulative_kwh - pair[0].cumulative_kwh).max(0.0);
            let bucket = usage
                .entry(bucket_start(pair[0].timestamp, interval))
                .or_default();
            bucket.kwh += delta;
            bucket.intervals += 1;
        }
        for (bucket, peak) in meter_peak {
            usage.entry(bucket).or_default().peak_kw += peak;
        }
    }
    usage
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselinePoint {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub kwh: f64,
    pub peak_kw: f64,
}

/// Expected consumption for each bucket of a period.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineSeries {
    pub points: Vec<BaselinePoint>,
    pub method: BaselineMethod,
    pub low_confidence: bool,
    /// Fewest comparable days found for any day of the period.
    pub comparable_days: u32,
}

impl BaselineSeries {
    pub fn total_kwh(&self) -> f64 {
        self.points.iter().map(|p| p.kwh).sum()
    }

    pub fn peak_kw(&self) -> f64 {
        self.points.iter().map(|p| p.peak_kw).fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BaselineEstimator {
    settings: BaselineSettings,
}

impl BaselineEstimator {
    pub fn new(settings: BaselineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BaselineSettings {
        &self.settings
    }

    /// Estimates the baseline for `[period_start, period_end)`.
    ///
    /// # Arguments
    ///
    /// * `tz` - Facility timezone; weekdays and days are local
    /// * `zone` - Zone meter to baseline, or `None` for the whole facility
    /// * `history` - Readings covering at least [`BaselineSettings::history_start`];
    ///   readings inside the period are ignored
    /// * `events` - Registered non-routine events for the facility
    ///
    /// # Returns
    ///
    /// A bucketed series. Never fails: thin history yields a flat,
    /// low-confidence baseline and no history a zero one.
    pub fn estimate(
        &self,
        tz: Tz,
        zone: Option<&str>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        history: &[EnergyReading],
        events: &[NonRoutineEvent],
    ) -> BaselineSeries {
        let interval = self.settings.interval();
        let mut events: Vec<&NonRoutineEvent> =
            events.iter().filter(|e| e.applies_to(zone)).collect();
        events.sort_by_key(|e| e.effective_from);

        let usage: BTreeMap<_, _> = meter_usage(history, zone, interval)
            .into_iter()
            .filter(|(bucket, _)| *bucket < period_start)
            .collect();
        let data_days: BTreeSet<NaiveDate> = usage
            .iter()
            .filter(|(_, seen)| seen.intervals > 0)
            .map(|(b, _)| b.with_timezone(&tz).date_naive())
            .collect();

        let buckets = period_buckets(period_start, period_end, interval);
        let comparable_days = buckets
            .iter()
            .map(|b| self.comparable_days(tz, *b, &data_days))
            .min()
            .unwrap_or(0);

        if comparable_days < self.settings.min_comparable_days {
            debug!(
                comparable_days,
                required = self.settings.min_comparable_days,
                "insufficient comparable history, using flat baseline"
            );
            return self.flat_fallback(tz, period_start, &buckets, &usage, &events, comparable_days);
        }

        let points = buckets
            .iter()
            .map(|&start| {
                let mut kwh = 0.0;
                let mut peak_kw = 0.0;
                let mut weeks = 0u32;
                for k in 1..=self.settings.lookback_weeks {
                    let Some(then) = weeks_back(tz, start, k) else {
                        continue;
                    };
                    if !data_days.contains(&then.with_timezone(&tz).date_naive()) {
                        continue;
                    }
                    let factor = adjustment(&events, then, start);
                    let seen = usage
                        .get(&bucket_start(then, interval))
                        .copied()
                        .unwrap_or_default();
                    kwh += seen.kwh * factor;
                    peak_kw += seen.peak_kw * factor;
                    weeks += 1;
                }
                let n = f64::from(weeks.max(1));
                BaselinePoint {
                    start,
                    end: start + interval,
                    kwh: kwh / n,
                    peak_kw: peak_kw / n,
                }
            })
            .collect();

        BaselineSeries {
            points,
            method: BaselineMethod::ComparableDays,
            low_confidence: false,
            comparable_days,
        }
    }

    fn comparable_days(&self, tz: Tz, at: DateTime<Utc>, data_days: &BTreeSet<NaiveDate>) -> u32 {
        (1..=self.settings.lookback_weeks)
            .filter_map(|k| weeks_back(tz, at, k))
            .filter(|then| data_days.contains(&then.with_timezone(&tz).date_naive()))
            .count() as u32
    }

    fn flat_fallback(
        &self,
        tz: Tz,
        period_start: DateTime<Utc>,
        buckets: &[DateTime<Utc>],
        usage: &BTreeMap<DateTime<Utc>, BucketUsage>,
        events: &[&NonRoutineEvent],
        comparable_days: u32,
    ) -> BaselineSeries {
        let interval = self.settings.interval();
        let from = period_start - TimeDelta::days(i64::from(self.settings.fallback_days));

        let mut total = 0.0;
        let mut peak: f64 = 0.0;
        let mut days = BTreeSet::new();
        for (&bucket, seen) in usage.range(from..period_start) {
            let factor = adjustment(events, bucket, period_start);
            total += seen.kwh * factor;
            peak = peak.max(seen.peak_kw * factor);
            if seen.intervals > 0 {
                days.insert(bucket.with_timezone(&tz).date_naive());
            }
        }

        let per_bucket = if days.is_empty() {
            0.0
        } else {
            total / (days.len() as f64 * self.settings.buckets_per_day())
        };

        BaselineSeries {
            points: buckets
                .iter()
                .map(|&start| BaselinePoint {
                    start,
                    end: start + interval,
                    kwh: per_bucket,
                    peak_kw: peak,
                })
                .collect(),
            method: BaselineMethod::FlatAverage,
            low_confidence: true,
            comparable_days,
        }
    }
}

/// Bucket starts covering `[start, end)`.
pub fn period_buckets(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: TimeDelta,
) -> Vec<DateTime<Utc>> {
    let mut out = Vec::new();
    let mut t = bucket_start(start, interval);
    while t < end {
        out.push(t);
        t += interval;
    }
    out
}

/// Same local wall-clock time `weeks` weeks earlier.
fn weeks_back(tz: Tz, at: DateTime<Utc>, weeks: u32) -> Option<DateTime<Utc>> {
    let local = at.with_timezone(&tz).naive_local() - TimeDelta::weeks(i64::from(weeks));
    tz.from_local_datetime(&local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// Product of the load factors of events taking effect in `(then, target]`.
fn adjustment(events: &[&NonRoutineEvent], then: DateTime<Utc>, target: DateTime<Utc>) -> f64 {
    events
        .iter()
        .filter(|e| then < e.effective_from && e.effective_from <= target)
        .map(|e| e.load_factor)
        .product()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, day, hour, 0, 0).unwrap()
    }

    /// Hourly main-meter readings over `[from, to]` at a constant `kw`.
    fn constant_load(from: DateTime<Utc>, to: DateTime<Utc>, kw: f64) -> Vec<EnergyReading> {
        let mut out = Vec::new();
        let mut at = from;
        let mut register = 1_000.0;
        while at <= to {
            out.push(EnergyReading {
                facility_id: "f".to_string(),
                zone_id: None,
                timestamp: at,
                power_kw: kw,
                cumulative_kwh: register,
                cost: 0.0,
            });
            register += kw;
            at += TimeDelta::hours(1);
        }
        out
    }

    fn hourly() -> BaselineEstimator {
        BaselineEstimator::new(BaselineSettings {
            interval_minutes: 60,
            ..BaselineSettings::default()
        })
    }

    #[test]
    fn meter_usage_attributes_delta_to_earlier_bucket() {
        let readings = constant_load(t(1, 0), t(1, 3), 5.0);
        let usage = meter_usage(&readings, None, TimeDelta::hours(1));
        assert_eq!(usage[&t(1, 0)].kwh, 5.0);
        assert_eq!(usage[&t(1, 2)].kwh, 5.0);
        // last reading only contributes demand
        assert_eq!(usage[&t(1, 3)].kwh, 0.0);
        assert_eq!(usage[&t(1, 3)].peak_kw, 5.0);
    }

    #[test]
    fn meter_usage_prefers_main_meter_and_ignores_resets() {
        let mut readings = constant_load(t(1, 0), t(1, 2), 5.0);
        readings.push(EnergyReading {
            zone_id: Some("z1".to_string()),
            ..readings[0].clone()
        });
        let usage = meter_usage(&readings, None, TimeDelta::hours(1));
        assert_eq!(usage[&t(1, 0)].kwh, 5.0);

        readings[1].cumulative_kwh = 0.0;
        let usage = meter_usage(&readings, None, TimeDelta::hours(1));
        assert_eq!(usage[&t(1, 0)].kwh, 0.0);
    }

    #[test]
    fn comparable_weeks_are_averaged() {
        // 2026-06-29 is a Monday; history on the four previous Mondays.
        let mut history = Vec::new();
        for (week, kw) in [(1, 10.0), (2, 20.0), (3, 30.0), (4, 40.0)] {
            let day = 29 - 7 * week;
            history.extend(constant_load(t(day, 0), t(day, 23), kw));
        }
        let series = hourly().estimate(Tz::UTC, None, t(29, 10), t(29, 12), &history, &[]);

        assert_eq!(series.method, BaselineMethod::ComparableDays);
        assert!(!series.low_confidence);
        assert_eq!(series.comparable_days, 4);
        assert_eq!(series.points.len(), 2);
        assert_eq!(series.points[0].kwh, 25.0);
        assert_eq!(series.total_kwh(), 50.0);
        assert_eq!(series.peak_kw(), 25.0);
    }

    #[test]
    fn thin_history_falls_back_to_flat_average() {
        let history = constant_load(t(27, 0), t(29, 0), 12.0);
        let series = hourly().estimate(Tz::UTC, None, t(29, 16), t(29, 21), &history, &[]);

        assert_eq!(series.method, BaselineMethod::FlatAverage);
        assert!(series.low_confidence);
        assert_eq!(series.points.len(), 5);
        // 48 hourly deltas of 12 kWh over two days
        assert!((series.points[0].kwh - 12.0).abs() < 1e-9);
    }

    #[test]
    fn no_history_gives_zero_low_confidence_baseline() {
        let series = hourly().estimate(Tz::UTC, Some("z1"), t(29, 0), t(29, 2), &[], &[]);
        assert!(series.low_confidence);
        assert_eq!(series.total_kwh(), 0.0);
    }

    #[test]
    fn non_routine_event_scales_prior_history() {
        let mut history = Vec::new();
        for week in 1..=4 {
            let day = 29 - 7 * week;
            history.extend(constant_load(t(day, 0), t(day, 23), 10.0));
        }
        let stage_change = NonRoutineEvent {
            facility_id: "f".to_string(),
            zone_id: None,
            effective_from: t(28, 0),
            load_factor: 1.5,
            description: "flowering lights on".to_string(),
        };
        let series = hourly().estimate(
            Tz::UTC,
            None,
            t(29, 10),
            t(29, 11),
            &history,
            &[stage_change],
        );
        assert_eq!(series.points[0].kwh, 15.0);
    }

    #[test]
    fn estimate_is_deterministic_under_input_order() {
        let mut history = Vec::new();
        for week in 1..=4 {
            let day = 29 - 7 * week;
            history.extend(constant_load(t(day, 0), t(day, 23), f64::from(week) * 3.3));
        }
        let a = hourly().estimate(Tz::UTC, None, t(29, 0), t(29, 6), &history, &[]);
        history.reverse();
        let b = hourly().estimate(Tz::UTC, None, t(29, 0), t(29, 6), &history, &[]);
        assert_eq!(a, b);
    }
}
