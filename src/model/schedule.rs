//! Load-shedding schedule records and their lifecycle vocabulary.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::facility::{FacilityId, ZoneId};
use crate::error::{Error, Result};

/// Schedule priority; `High` (1) beats `Medium` (2) beats `Low` (3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::High),
            2 => Ok(Self::Medium),
            3 => Ok(Self::Low),
            other => Err(format!("priority must be 1, 2 or 3, got {other}")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShedReason {
    PeakDemand,
    GridEvent,
    CostOptimization,
    Manual,
}

impl fmt::Display for ShedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PeakDemand => "peak_demand",
            Self::GridEvent => "grid_event",
            Self::CostOptimization => "cost_optimization",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// What the shed physically does to the zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    #[default]
    ReduceLight,
    ReduceHvac,
    Shift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    User,
    SafetyViolation,
    SafetyTimeout,
    Superseded,
    /// Window passed without the schedule ever activating.
    Expired,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::SafetyViolation => "safety_violation",
            Self::SafetyTimeout => "safety_timeout",
            Self::Superseded => "superseded",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Validated request to create a schedule.
///
/// Construct with [`ShedRequest::new`]; the reason-specific priority rules
/// are applied there so every caller sees the same normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ShedRequest {
    pub facility_id: FacilityId,
    pub zone_id: ZoneId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub target_reduction_kw: f64,
    pub priority: Priority,
    pub reason: ShedReason,
    pub action: ActionKind,
    pub dr_event_id: Option<String>,
}

impl ShedRequest {
    /// Validates and normalizes a shed request.
    ///
    /// `grid_event` requests are forced to priority 1 and
    /// `cost_optimization` requests to priority 3.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the window is empty or the
    /// target is not a positive finite number.
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        facility_id: impl Into<FacilityId>,
        zone_id: impl Into<ZoneId>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        target_reduction_kw: f64,
        priority: Priority,
        reason: ShedReason,
        action: ActionKind,
    ) -> Result<Self> {
        if start_time >= end_time {
            return Err(Error::InvalidRequest(
                "startTime must be before endTime".to_string(),
            ));
        }
        if !target_reduction_kw.is_finite() || target_reduction_kw <= 0.0 {
            return Err(Error::InvalidRequest(
                "targetReductionKw must be a positive number".to_string(),
            ));
        }
        let priority = match reason {
            ShedReason::GridEvent => Priority::High,
            ShedReason::CostOptimization => Priority::Low,
            ShedReason::PeakDemand | ShedReason::Manual => priority,
        };
        Ok(Self {
            facility_id: facility_id.into(),
            zone_id: zone_id.into(),
            start_time,
            end_time,
            target_reduction_kw,
            priority,
            reason,
            action,
            dr_event_id: None,
        })
    }

    pub fn with_dr_event(mut self, event_id: impl Into<String>) -> Self {
        self.dr_event_id = Some(event_id.into());
        self
    }
}

/// A time-bounded load reduction on one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSheddingSchedule {
    pub id: Uuid,
    pub facility_id: FacilityId,
    pub zone_id: ZoneId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub target_reduction_kw: f64,
    pub priority: Priority,
    pub reason: ShedReason,
    pub action: ActionKind,
    pub status: ScheduleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dr_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// First tick at which activation was refused for safety.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_since: Option<DateTime<Utc>>,
    /// Actuation was never acknowledged; the shed may not have happened.
    pub degraded: bool,
}

impl LoadSheddingSchedule {
    pub fn from_request(request: ShedRequest, id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            facility_id: request.facility_id,
            zone_id: request.zone_id,
            start_time: request.start_time,
            end_time: request.end_time,
            target_reduction_kw: request.target_reduction_kw,
            priority: request.priority,
            reason: request.reason,
            action: request.action,
            status: ScheduleStatus::Pending,
            cancel_reason: None,
            dr_event_id: request.dr_event_id,
            created_at,
            activated_at: None,
            finished_at: None,
            held_since: None,
            degraded: false,
        }
    }

    /// PENDING or ACTIVE.
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Returns `true` when `[start, end)` intersects this schedule's window.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time < end && start < self.end_time
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now < self.end_time
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> TimeDelta {
        (self.end_time - now.max(self.start_time)).max(TimeDelta::zero())
    }

    /// Deterministic ordering key: priority, grid events first, then age.
    pub fn precedence(&self) -> (u8, bool, DateTime<Utc>, Uuid) {
        (
            self.priority.rank(),
            self.reason != ShedReason::GridEvent,
            self.created_at,
            self.id,
        )
    }
}
