use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::facility::FacilityId;
use crate::error::{Error, Result};

/// Utility or aggregator request for temporary load reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemandResponseEvent {
    /// Issuer-assigned event id; also the deduplication key.
    pub id: String,
    pub facility_id: FacilityId,
    /// Utility or aggregator id.
    pub issued_by: String,
    /// Window start (inclusive).
    pub window_start: DateTime<Utc>,
    /// Window end (exclusive).
    pub window_end: DateTime<Utc>,
    /// Requested reduction while the event is active.
    pub required_reduction_kw: f64,
    /// Compensation paid per kW delivered.
    pub compensation_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl DemandResponseEvent {
    /// Creates a new demand-response event spanning `[window_start, window_end)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the window is empty or the
    /// requested reduction or compensation rate is negative.
    pub fn new(
        id: impl Into<String>,
        facility_id: impl Into<FacilityId>,
        issued_by: impl Into<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        required_reduction_kw: f64,
        compensation_rate: f64,
    ) -> Result<Self> {
        if window_start >= window_end {
            return Err(Error::InvalidRequest(
                "windowStart must be before windowEnd".to_string(),
            ));
        }
        if !(required_reduction_kw.is_finite() && required_reduction_kw > 0.0) {
            return Err(Error::InvalidRequest(
                "requiredReductionKw must be a positive number".to_string(),
            ));
        }
        if !(compensation_rate.is_finite() && compensation_rate >= 0.0) {
            return Err(Error::InvalidRequest(
                "compensationRate must be >= 0".to_string(),
            ));
        }

        Ok(Self {
            id: id.into(),
            facility_id: facility_id.into(),
            issued_by: issued_by.into(),
            window_start,
            window_end,
            required_reduction_kw,
            compensation_rate,
            acknowledged_at: None,
        })
    }

    /// Returns `true` once the window has closed; such events can no longer be allocated.
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 3, h, 0, 0).unwrap()
    }

    fn event(start: u32, end: u32, kw: f64) -> DemandResponseEvent {
        DemandResponseEvent::new("evt-1", "f", "aggregator", at(start), at(end), kw, 1.2).unwrap()
    }

    #[test]
    fn ends_at_window_close() {
        let e = event(5, 8, 2.0);
        assert!(!e.has_ended(at(7)));
        assert!(e.has_ended(at(8)));
        assert!(e.acknowledged_at.is_none());
    }

    #[test]
    fn rejects_non_positive_reduction_and_negative_rate() {
        let zero = DemandResponseEvent::new("e", "f", "u", at(10), at(12), 0.0, 0.0);
        assert!(matches!(zero, Err(Error::InvalidRequest(_))));
        let rate = DemandResponseEvent::new("e", "f", "u", at(10), at(12), 5.0, -1.0);
        assert!(matches!(rate, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn rejects_inverted_window() {
        let err = DemandResponseEvent::new("e", "f", "u", at(12), at(10), 1.0, 0.0);
        assert!(matches!(err, Err(Error::InvalidRequest(_))));
    }
}
