//! Request bodies, query parameters and error responses.
//!
//! Every inbound DTO rejects unknown fields and converts into a validated
//! domain value with `TryFrom` before it reaches the control plane.

use axum::Json;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::{ActionKind, DemandResponseEvent, Priority, ShedReason, ShedRequest};

/// `POST /load-shedding` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateScheduleBody {
    pub facility_id: String,
    pub zone_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub target_reduction_kw: f64,
    /// 1 (high) to 3 (low); defaults to 2. Ignored for grid and cost reasons.
    #[serde(default)]
    pub priority: Option<u8>,
    pub reason: ShedReason,
    #[serde(default)]
    pub action: ActionKind,
}

impl TryFrom<CreateScheduleBody> for ShedRequest {
    type Error = Error;

    fn try_from(body: CreateScheduleBody) -> Result<Self, Self::Error> {
        let priority = match body.priority {
            Some(raw) => Priority::try_from(raw).map_err(Error::InvalidRequest)?,
            None => Priority::Medium,
        };
        if body.facility_id.trim().is_empty() || body.zone_id.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "facilityId and zoneId are required".to_string(),
            ));
        }
        ShedRequest::new(
            body.facility_id,
            body.zone_id,
            body.start_time,
            body.end_time,
            body.target_reduction_kw,
            priority,
            body.reason,
            body.action,
        )
    }
}

/// `POST /demand-response/events` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DrEventBody {
    pub id: String,
    pub facility_id: String,
    pub issued_by: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub required_reduction_kw: f64,
    #[serde(default)]
    pub compensation_rate: f64,
}

impl TryFrom<DrEventBody> for DemandResponseEvent {
    type Error = Error;

    fn try_from(body: DrEventBody) -> Result<Self, Self::Error> {
        if body.id.trim().is_empty() {
            return Err(Error::InvalidRequest("id is required".to_string()));
        }
        DemandResponseEvent::new(
            body.id,
            body.facility_id,
            body.issued_by,
            body.window_start,
            body.window_end,
            body.required_reduction_kw,
            body.compensation_rate,
        )
    }
}

/// `POST /savings/reports` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReportBody {
    pub facility_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FacilityQuery {
    pub facility_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReportsQuery {
    pub facility_id: String,
    /// Defaults to 10, capped at 100.
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub facilities: usize,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Maps a domain error to its HTTP status.
pub fn api_error(err: Error) -> ApiError {
    let status = match &err {
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::CapacityExceeded { .. } | Error::ScheduleClosed { .. } => StatusCode::CONFLICT,
        Error::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Store(_) | Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// A body or query string that failed to parse is a 400, whatever axum's default.
pub fn rejection(message: impl Into<String>) -> ApiError {
    api_error(Error::InvalidRequest(message.into()))
}
