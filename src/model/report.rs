use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::facility::FacilityId;

/// How a baseline was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineMethod {
    /// Mean of the same weekday/bucket across prior weeks.
    ComparableDays,
    /// Flat average of the most recent days; provisional.
    FlatAverage,
}

/// Verified savings for one facility and reporting window.
///
/// Derived data: regenerable from readings, baseline configuration and
/// tariff. Every numeric field is a deterministic function of those inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavingsReport {
    pub facility_id: FacilityId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub baseline_kwh: f64,
    pub actual_kwh: f64,
    /// `max(0, baseline - actual)`.
    pub kwh_saved: f64,
    /// Signed `baseline - actual`, for diagnostics.
    pub raw_delta_kwh: f64,
    pub cost_saved: f64,
    pub demand_charge_saved: f64,
    pub peak_reduction_kw: f64,
    pub baseline_peak_kw: f64,
    pub actual_peak_kw: f64,
    pub co2_avoided_kg: f64,
    /// Baseline came from the flat-average fallback; numbers are provisional.
    pub low_confidence: bool,
    /// No tariff resolved for part of the period; cost figures use the
    /// fallback rate and are provisional.
    pub rate_fallback: bool,
    pub baseline_method: BaselineMethod,
    /// Degraded (unacknowledged) schedules overlapping the period.
    pub degraded_schedules: usize,
    pub generated_at: DateTime<Utc>,
}

impl SavingsReport {
    /// Compares every input-derived field, ignoring `generated_at`.
    pub fn same_figures(&self, other: &Self) -> bool {
        self.facility_id == other.facility_id
            && self.period_start == other.period_start
            && self.period_end == other.period_end
            && self.baseline_kwh.to_bits() == other.baseline_kwh.to_bits()
            && self.actual_kwh.to_bits() == other.actual_kwh.to_bits()
            && self.kwh_saved.to_bits() == other.kwh_saved.to_bits()
            && self.raw_delta_kwh.to_bits() == other.raw_delta_kwh.to_bits()
            && self.cost_saved.to_bits() == other.cost_saved.to_bits()
            && self.demand_charge_saved.to_bits() == other.demand_charge_saved.to_bits()
            && self.peak_reduction_kw.to_bits() == other.peak_reduction_kw.to_bits()
            && self.baseline_peak_kw.to_bits() == other.baseline_peak_kw.to_bits()
            && self.actual_peak_kw.to_bits() == other.actual_peak_kw.to_bits()
            && self.co2_avoided_kg.to_bits() == other.co2_avoided_kg.to_bits()
            && self.low_confidence == other.low_confidence
            && self.rate_fallback == other.rate_fallback
            && self.baseline_method == other.baseline_method
            && self.degraded_schedules == other.degraded_schedules
    }
}

impl fmt::Display for SavingsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "--- Savings Report: {} ({} .. {}) ---",
            self.facility_id, self.period_start, self.period_end
        )?;
        if self.low_confidence {
            writeln!(f, "PROVISIONAL: insufficient comparable history")?;
        }
        if self.rate_fallback {
            writeln!(f, "PROVISIONAL: costs at fallback rate, no tariff published")?;
        }
        writeln!(f, "Baseline energy:       {:.3} kWh", self.baseline_kwh)?;
        writeln!(f, "Actual energy:         {:.3} kWh", self.actual_kwh)?;
        writeln!(
            f,
            "Energy saved:          {:.3} kWh (raw delta {:.3})",
            self.kwh_saved, self.raw_delta_kwh
        )?;
        writeln!(f, "Cost saved:            {:.2}", self.cost_saved)?;
        writeln!(f, "Demand charge saved:   {:.2}", self.demand_charge_saved)?;
        writeln!(
            f,
            "Peak reduction:        {:.3} kW ({:.3} -> {:.3})",
            self.peak_reduction_kw, self.baseline_peak_kw, self.actual_peak_kw
        )?;
        write!(f, "CO2 avoided:           {:.3} kg", self.co2_avoided_kg)
    }
}
