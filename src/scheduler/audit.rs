use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{FacilityId, LoadSheddingSchedule, ScheduleStatus, ZoneId};

/// One lifecycle transition (or actuation incident) of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub facility_id: FacilityId,
    pub zone_id: ZoneId,
    pub schedule_id: Uuid,
    /// `None` for creation.
    pub from: Option<ScheduleStatus>,
    pub to: ScheduleStatus,
    pub detail: String,
}

impl AuditEntry {
    pub fn transition(
        at: DateTime<Utc>,
        schedule: &LoadSheddingSchedule,
        from: Option<ScheduleStatus>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            at,
            facility_id: schedule.facility_id.clone(),
            zone_id: schedule.zone_id.clone(),
            schedule_id: schedule.id,
            from,
            to: schedule.status,
            detail: detail.into(),
        }
    }
}
