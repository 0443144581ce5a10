//! Measurement and verification of savings against the baseline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{info, warn};

use crate::baseline::{self, BaselineEstimator};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::{
    EnergyReading, Facility, LoadSheddingSchedule, NonRoutineEvent, SavingsReport,
};
use crate::ports::{Store, bounded};
use crate::rates::{RateBook, RateQuote};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerificationSettings {
    /// Conservative energy rate used when the tariff cannot be resolved.
    pub fallback_energy_rate: f64,
    /// Grid emissions factor (kg CO2e/kWh) when the region is unknown.
    pub default_emissions_factor: f64,
    /// Emissions factor per grid region.
    pub emissions_factors: BTreeMap<String, f64>,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            fallback_energy_rate: 0.10,
            default_emissions_factor: 0.4,
            emissions_factors: BTreeMap::new(),
        }
    }
}

impl VerificationSettings {
    pub fn emissions_factor(&self, region: Option<&str>) -> f64 {
        region
            .and_then(|r| self.emissions_factors.get(r))
            .copied()
            .unwrap_or(self.default_emissions_factor)
    }
}

fn round_to(value: f64, per_unit: f64) -> f64 {
    let rounded = (value * per_unit).round() / per_unit;
    // normalise -0.0
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// Energy and power: 1e-3 resolution.
fn kwh(value: f64) -> f64 {
    round_to(value, 1_000.0)
}

/// Money: cents.
fn money(value: f64) -> f64 {
    round_to(value, 100.0)
}

/// Everything a report is derived from.
#[derive(Debug, Clone, Copy)]
pub struct ReportInputs<'a> {
    pub facility: &'a Facility,
    pub tz: Tz,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Readings from the baseline history start through `period_end`.
    pub readings: &'a [EnergyReading],
    pub events: &'a [NonRoutineEvent],
    pub schedules: &'a [LoadSheddingSchedule],
    pub rates: &'a RateBook,
}

/// Computes a savings report from its inputs. Pure: identical inputs give
/// bitwise-identical figures; only `generated_at` differs between runs.
pub fn compute_report(
    inputs: ReportInputs<'_>,
    estimator: &BaselineEstimator,
    settings: &VerificationSettings,
    generated_at: DateTime<Utc>,
) -> SavingsReport {
    let interval = estimator.settings().interval();
    let baseline = estimator.estimate(
        inputs.tz,
        None,
        inputs.period_start,
        inputs.period_end,
        inputs.readings,
        inputs.events,
    );
    let usage = baseline::meter_usage(inputs.readings, None, interval);

    let mut baseline_kwh = 0.0;
    let mut actual_kwh = 0.0;
    let mut actual_peak_kw: f64 = 0.0;
    let mut cost_delta = 0.0;
    let mut rate_fallback = false;
    let mut quote = |at: DateTime<Utc>| {
        inputs.rates.rate_at(at).unwrap_or_else(|_| {
            rate_fallback = true;
            RateQuote::fallback(settings.fallback_energy_rate)
        })
    };
    for point in &baseline.points {
        let actual = usage.get(&point.start).copied().unwrap_or_default();
        let rate = quote(point.start);
        baseline_kwh += point.kwh;
        actual_kwh += actual.kwh;
        actual_peak_kw = actual_peak_kw.max(actual.peak_kw);
        cost_delta += (point.kwh - actual.kwh) * rate.energy_rate;
    }

    let raw_delta_kwh = baseline_kwh - actual_kwh;
    let kwh_saved = raw_delta_kwh.max(0.0);
    let baseline_peak_kw = baseline.peak_kw();
    let peak_reduction_kw = baseline_peak_kw - actual_peak_kw;
    let demand_charge = quote(inputs.period_start).demand_charge;
    let co2_factor = settings.emissions_factor(inputs.facility.emissions_region.as_deref());
    let degraded_schedules = inputs
        .schedules
        .iter()
        .filter(|s| s.degraded && s.overlaps(inputs.period_start, inputs.period_end))
        .count();

    SavingsReport {
        facility_id: inputs.facility.id.clone(),
        period_start: inputs.period_start,
        period_end: inputs.period_end,
        baseline_kwh: kwh(baseline_kwh),
        actual_kwh: kwh(actual_kwh),
        kwh_saved: kwh(kwh_saved),
        raw_delta_kwh: kwh(raw_delta_kwh),
        cost_saved: money(cost_delta.max(0.0)),
        demand_charge_saved: money(peak_reduction_kw.max(0.0) * demand_charge),
        peak_reduction_kw: kwh(peak_reduction_kw),
        baseline_peak_kw: kwh(baseline_peak_kw),
        actual_peak_kw: kwh(actual_peak_kw),
        co2_avoided_kg: kwh(kwh_saved * co2_factor),
        low_confidence: baseline.low_confidence,
        rate_fallback,
        baseline_method: baseline.method,
        degraded_schedules,
        generated_at,
    }
}

/// Generates, caches and lists verified savings reports.
pub struct SavingsEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    estimator: BaselineEstimator,
    settings: VerificationSettings,
    retry: RetryPolicy,
    io_timeout: Duration,
}

impl SavingsEngine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        estimator: BaselineEstimator,
        settings: VerificationSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            estimator,
            settings,
            retry,
            io_timeout: Duration::from_secs(2),
        }
    }

    /// Deadline for each store read.
    pub fn with_io_timeout(mut self, limit: Duration) -> Self {
        self.io_timeout = limit;
        self
    }

    /// Builds the savings report for `[period_start, period_end)` and caches it.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidRequest`] for an empty period
    /// * [`Error::NotFound`] for an unknown facility
    /// * [`Error::Configuration`] for an invalid facility timezone
    /// * [`Error::Store`] if inputs cannot be read or the report cannot be saved
    pub async fn generate_report(
        &self,
        facility_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<SavingsReport> {
        if period_start >= period_end {
            return Err(Error::InvalidRequest(
                "periodStart must be before periodEnd".to_string(),
            ));
        }
        let io = self.io_timeout;
        let facility = bounded(io, self.store.facility(facility_id))
            .await?
            .ok_or_else(|| Error::not_found("facility", facility_id))?;
        let tz = facility.tz()?;

        let history_start = self.estimator.settings().history_start(period_start);
        let readings = bounded(
            io,
            self.store.readings(facility_id, None, history_start, period_end),
        )
        .await?;
        let events = bounded(io, self.store.non_routine_events(facility_id)).await?;
        let schedules = bounded(io, self.store.schedules(facility_id)).await?;
        let tariffs = bounded(io, self.store.rate_schedules(&facility.rate_zone)).await?;
        let rates = RateBook::for_facility(&facility, tariffs)?;
        if !rates.has_schedules() {
            warn!(
                facility_id,
                rate_zone = %facility.rate_zone,
                "no tariff published, costing at fallback rate"
            );
        }

        let report = compute_report(
            ReportInputs {
                facility: &facility,
                tz,
                period_start,
                period_end,
                readings: &readings,
                events: &events,
                schedules: &schedules,
                rates: &rates,
            },
            &self.estimator,
            &self.settings,
            self.clock.now(),
        );

        self.retry
            .run("save savings report", || self.store.save_report(&report))
            .await?;
        info!(
            facility_id,
            %period_start,
            %period_end,
            kwh_saved = report.kwh_saved,
            cost_saved = report.cost_saved,
            low_confidence = report.low_confidence,
            rate_fallback = report.rate_fallback,
            "savings report generated"
        );
        Ok(report)
    }

    /// Cached reports for a facility, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the cache cannot be read.
    pub async fn recent_reports(
        &self,
        facility_id: &str,
        limit: usize,
    ) -> Result<Vec<SavingsReport>> {
        Ok(bounded(self.io_timeout, self.store.recent_reports(facility_id, limit)).await?)
    }
}
