//! Utility tariffs: time-of-use windows, peak definitions and demand charges.
//!
//! A [`RateBook`] holds every published version of one rate-zone's tariff
//! together with the facility timezone, and answers `rate_at(timestamp)`.

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::Facility;

/// One time-of-use window in facility local time.
///
/// `start == end` covers the whole day. `start > end` wraps midnight, in
/// which case `days_of_week` refers to the day the window opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    /// Days the window applies to; absent means a default window for every day.
    #[serde(default)]
    pub days_of_week: Option<Vec<Weekday>>,
    /// Energy price per kWh.
    pub energy_rate: f64,
    #[serde(default)]
    pub is_peak: bool,
}

impl RateWindow {
    fn on_day(&self, day: Weekday) -> bool {
        self.days_of_week
            .as_ref()
            .is_none_or(|days| days.contains(&day))
    }

    /// Returns `true` if the window covers local `time` on `day`.
    pub fn covers(&self, day: Weekday, time: NaiveTime) -> bool {
        if self.start == self.end {
            self.on_day(day)
        } else if self.start < self.end {
            time >= self.start && time < self.end && self.on_day(day)
        } else {
            (time >= self.start && self.on_day(day)) || (time < self.end && self.on_day(day.pred()))
        }
    }

    /// Window length in minutes (1440 for an all-day window).
    pub fn span_minutes(&self) -> i64 {
        let span = (self.end - self.start).num_minutes();
        if span <= 0 { span + 24 * 60 } else { span }
    }

    pub fn is_default(&self) -> bool {
        self.days_of_week.is_none()
    }
}

/// One published version of a rate-zone tariff. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateSchedule {
    pub rate_zone: String,
    pub version: u32,
    pub effective_from: DateTime<Utc>,
    #[serde(default)]
    pub effective_to: Option<DateTime<Utc>>,
    pub windows: Vec<RateWindow>,
    /// Demand charge per kW of billing-period peak.
    pub demand_charge_per_kw: f64,
}

impl RateSchedule {
    pub fn is_effective(&self, at: DateTime<Utc>) -> bool {
        at >= self.effective_from && self.effective_to.is_none_or(|end| at < end)
    }

    /// Checks the published tariff for obviously broken data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.windows.is_empty() {
            return Err(Error::Configuration(format!(
                "rate schedule {} v{} has no windows",
                self.rate_zone, self.version
            )));
        }
        if let Some(w) = self
            .windows
            .iter()
            .find(|w| !(w.energy_rate.is_finite() && w.energy_rate >= 0.0))
        {
            return Err(Error::Configuration(format!(
                "rate schedule {} v{} has invalid energy rate {}",
                self.rate_zone, self.version, w.energy_rate
            )));
        }
        if !(self.demand_charge_per_kw.is_finite() && self.demand_charge_per_kw >= 0.0) {
            return Err(Error::Configuration(format!(
                "rate schedule {} v{} has invalid demand charge",
                self.rate_zone, self.version
            )));
        }
        if self.effective_to.is_some_and(|end| end <= self.effective_from) {
            return Err(Error::Configuration(format!(
                "rate schedule {} v{} ends before it starts",
                self.rate_zone, self.version
            )));
        }
        Ok(())
    }
}

/// Applicable pricing at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateQuote {
    pub energy_rate: f64,
    pub is_peak: bool,
    pub demand_charge: f64,
}

impl RateQuote {
    /// Conservative stand-in when no tariff resolves: flat rate, off-peak,
    /// no demand charge.
    pub fn fallback(energy_rate: f64) -> Self {
        Self {
            energy_rate,
            is_peak: false,
            demand_charge: 0.0,
        }
    }
}

/// All tariff versions of one rate-zone, evaluated in a facility's timezone.
#[derive(Debug, Clone)]
pub struct RateBook {
    rate_zone: String,
    tz: Tz,
    schedules: Vec<RateSchedule>,
}

impl RateBook {
    pub fn new(rate_zone: impl Into<String>, tz: Tz, schedules: Vec<RateSchedule>) -> Self {
        let rate_zone = rate_zone.into();
        let schedules = schedules
            .into_iter()
            .filter(|s| s.rate_zone == rate_zone)
            .collect();
        Self {
            rate_zone,
            tz,
            schedules,
        }
    }

    /// Builds the book for a facility from its rate-zone's published schedules.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unknown facility timezone.
    pub fn for_facility(facility: &Facility, schedules: Vec<RateSchedule>) -> Result<Self> {
        Ok(Self::new(facility.rate_zone.clone(), facility.tz()?, schedules))
    }

    pub fn rate_zone(&self) -> &str {
        &self.rate_zone
    }

    pub fn has_schedules(&self) -> bool {
        !self.schedules.is_empty()
    }

    /// The newest version in force at `at`.
    fn schedule_at(&self, at: DateTime<Utc>) -> Option<&RateSchedule> {
        self.schedules
            .iter()
            .filter(|s| s.is_effective(at))
            .max_by_key(|s| (s.version, s.effective_from))
    }

    /// Resolves the tariff at `at` using most-specific-match.
    ///
    /// Explicit day-of-week windows beat default windows; among equally
    /// specific windows the shorter one wins, then declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no schedule is published for the
    /// rate-zone at `at`, or if none of its windows covers the instant.
    pub fn rate_at(&self, at: DateTime<Utc>) -> Result<RateQuote> {
        let schedule = self.schedule_at(at).ok_or_else(|| {
            Error::Configuration(format!(
                "no rate schedule published for rate-zone {} at {at}",
                self.rate_zone
            ))
        })?;

        let local = at.with_timezone(&self.tz);
        let day = local.weekday();
        let time = local.time();

        schedule
            .windows
            .iter()
            .enumerate()
            .filter(|(_, w)| w.covers(day, time))
            .min_by_key(|(i, w)| (w.is_default(), w.span_minutes(), *i))
            .map(|(_, w)| RateQuote {
                energy_rate: w.energy_rate,
                is_peak: w.is_peak,
                demand_charge: schedule.demand_charge_per_kw,
            })
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "rate schedule {} v{} has no window covering {local}",
                    self.rate_zone, schedule.version
                ))
            })
    }

    /// Advisory lookup: substitutes a conservative flat rate when the tariff
    /// cannot be resolved. Never use on cost-impacting paths.
    pub fn rate_or_fallback(&self, at: DateTime<Utc>, fallback_rate: f64) -> RateQuote {
        self.rate_at(at).unwrap_or_else(|err| {
            warn!(rate_zone = %self.rate_zone, %at, "using fallback rate: {err}");
            RateQuote::fallback(fallback_rate)
        })
    }

    /// Enumerates contiguous peak intervals in `[from, to)`, sampled every `step`.
    ///
    /// # Errors
    ///
    /// Propagates the first [`Error::Configuration`] from [`RateBook::rate_at`].
    pub fn peak_windows(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: TimeDelta,
    ) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
        let step_secs = step.num_seconds().max(60);
        let aligned = from.timestamp() - from.timestamp().rem_euclid(step_secs);
        let mut t = DateTime::from_timestamp(aligned, 0).unwrap_or(from);
        let step = TimeDelta::seconds(step_secs);

        let mut windows = Vec::new();
        let mut open: Option<DateTime<Utc>> = None;
        while t < to {
            let peak = self.rate_at(t)?.is_peak;
            match (peak, open) {
                (true, None) => open = Some(t.max(from)),
                (false, Some(start)) => {
                    windows.push((start, t));
                    open = None;
                }
                _ => {}
            }
            t += step;
        }
        if let Some(start) = open {
            windows.push((start, to));
        }
        Ok(windows)
    }
}

/// `"HH:MM"` (or `"HH:MM:SS"`) serde representation for window bounds.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(|e| serde::de::Error::custom(format!("invalid time \"{raw}\": {e}")))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn window(
        start: NaiveTime,
        end: NaiveTime,
        days: Option<Vec<Weekday>>,
        rate: f64,
        peak: bool,
    ) -> RateWindow {
        RateWindow {
            start,
            end,
            days_of_week: days,
            energy_rate: rate,
            is_peak: peak,
        }
    }

    fn weekdays() -> Vec<Weekday> {
        vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
    }

    /// Off-peak all day at 0.12, weekday peak 16:00-21:00 at 0.45.
    fn tou_schedule(version: u32) -> RateSchedule {
        RateSchedule {
            rate_zone: "pge-e1".to_string(),
            version,
            effective_from: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            effective_to: None,
            windows: vec![
                window(hm(0, 0), hm(0, 0), None, 0.12, false),
                window(hm(16, 0), hm(21, 0), Some(weekdays()), 0.45, true),
            ],
            demand_charge_per_kw: 18.5,
        }
    }

    fn book(schedules: Vec<RateSchedule>) -> RateBook {
        RateBook::new("pge-e1", Tz::UTC, schedules)
    }

    #[test]
    fn specific_window_beats_default() {
        let book = book(vec![tou_schedule(1)]);
        // 2026-07-01 is a Wednesday
        let peak = book.rate_at(Utc.with_ymd_and_hms(2026, 7, 1, 17, 30, 0).unwrap()).unwrap();
        assert_eq!(peak.energy_rate, 0.45);
        assert!(peak.is_peak);
        assert_eq!(peak.demand_charge, 18.5);

        let off = book.rate_at(Utc.with_ymd_and_hms(2026, 7, 1, 21, 0, 0).unwrap()).unwrap();
        assert_eq!(off.energy_rate, 0.12);
        assert!(!off.is_peak);
    }

    #[test]
    fn weekend_falls_back_to_default_window() {
        let book = book(vec![tou_schedule(1)]);
        // 2026-07-04 is a Saturday
        let q = book.rate_at(Utc.with_ymd_and_hms(2026, 7, 4, 17, 0, 0).unwrap()).unwrap();
        assert_eq!(q.energy_rate, 0.12);
    }

    #[test]
    fn shorter_window_wins_at_equal_specificity() {
        let mut sched = tou_schedule(1);
        sched
            .windows
            .push(window(hm(18, 0), hm(19, 0), Some(weekdays()), 0.80, true));
        let q = book(vec![sched])
            .rate_at(Utc.with_ymd_and_hms(2026, 7, 1, 18, 15, 0).unwrap())
            .unwrap();
        assert_eq!(q.energy_rate, 0.80);
    }

    #[test]
    fn wrapping_window_uses_opening_day() {
        let w = window(hm(22, 0), hm(6, 0), Some(vec![Weekday::Fri]), 0.05, false);
        assert!(w.covers(Weekday::Fri, hm(23, 0)));
        assert!(w.covers(Weekday::Sat, hm(5, 59)));
        assert!(!w.covers(Weekday::Fri, hm(5, 0)));
        assert_eq!(w.span_minutes(), 8 * 60);
    }

    #[test]
    fn newer_version_supersedes() {
        let mut v2 = tou_schedule(2);
        v2.effective_from = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        v2.windows[1].energy_rate = 0.50;
        let book = book(vec![tou_schedule(1), v2]);

        let before = book.rate_at(Utc.with_ymd_and_hms(2026, 5, 6, 17, 0, 0).unwrap()).unwrap();
        assert_eq!(before.energy_rate, 0.45);
        let after = book.rate_at(Utc.with_ymd_and_hms(2026, 7, 1, 17, 0, 0).unwrap()).unwrap();
        assert_eq!(after.energy_rate, 0.50);
    }

    #[test]
    fn missing_schedule_is_configuration_error() {
        let err = book(Vec::new()).rate_at(Utc.with_ymd_and_hms(2026, 7, 1, 17, 0, 0).unwrap());
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn uncovered_instant_is_configuration_error() {
        let mut sched = tou_schedule(1);
        sched.windows.remove(0);
        let err = book(vec![sched]).rate_at(Utc.with_ymd_and_hms(2026, 7, 1, 9, 0, 0).unwrap());
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn fallback_rate_for_advisory_use() {
        let when = Utc.with_ymd_and_hms(2026, 7, 1, 17, 0, 0).unwrap();
        let q = book(Vec::new()).rate_or_fallback(when, 0.30);
        assert_eq!(q.energy_rate, 0.30);
        assert!(!q.is_peak);
    }

    #[test]
    fn evaluates_windows_in_facility_local_time() {
        let book = RateBook::new("pge-e1", Tz::America__Los_Angeles, vec![tou_schedule(1)]);
        // 00:30 UTC Thursday = 17:30 PDT Wednesday
        let q = book.rate_at(Utc.with_ymd_and_hms(2026, 7, 2, 0, 30, 0).unwrap()).unwrap();
        assert!(q.is_peak);
    }

    #[test]
    fn peak_windows_are_merged() {
        let book = book(vec![tou_schedule(1)]);
        let from = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2026, 7, 2, 12, 0, 0).unwrap();
        let windows = book.peak_windows(from, to, TimeDelta::minutes(15)).unwrap();
        assert_eq!(
            windows,
            vec![(
                Utc.with_ymd_and_hms(2026, 7, 1, 16, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 7, 1, 21, 0, 0).unwrap()
            )]
        );
    }

    #[test]
    fn window_times_parse_from_hhmm() {
        let json = r#"{"start":"16:00","end":"21:00","daysOfWeek":["Mon","fri"],"energyRate":0.45,"isPeak":true}"#;
        let w: RateWindow = serde_json::from_str(json).unwrap();
        assert_eq!(w.start, hm(16, 0));
        assert_eq!(w.days_of_week, Some(vec![Weekday::Mon, Weekday::Fri]));
    }
}
