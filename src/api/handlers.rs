//! Request handlers for the API endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use uuid::Uuid;

use super::AppState;
use super::types::{
    ApiError, CreateScheduleBody, DrEventBody, FacilityQuery, HealthResponse, ReportBody,
    ReportsQuery, api_error, rejection,
};
use crate::dr::DrAllocation;
use crate::error::Error;
use crate::model::{DemandResponseEvent, LoadSheddingSchedule, SavingsReport, ShedRequest};
use crate::recommend::{Recommendation, recommendations as derive_recommendations};

const DEFAULT_REPORT_LIMIT: usize = 10;
const MAX_REPORT_LIMIT: usize = 100;

/// Creates a load-shedding schedule.
///
/// `POST /load-shedding` → 201 + schedule, 400 / 404 / 409 / 422 on failure
pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateScheduleBody>, JsonRejection>,
) -> Result<(StatusCode, Json<LoadSheddingSchedule>), ApiError> {
    let Json(body) = body.map_err(|e| rejection(e.body_text()))?;
    let request = ShedRequest::try_from(body).map_err(api_error)?;
    let schedule = state.plane.create(request).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// Lists the open (PENDING or ACTIVE) schedules of a facility.
///
/// `GET /load-shedding?facilityId=` → 200 + `Vec<LoadSheddingSchedule>`
pub async fn list_schedules(
    State(state): State<Arc<AppState>>,
    query: Result<Query<FacilityQuery>, QueryRejection>,
) -> Result<Json<Vec<LoadSheddingSchedule>>, ApiError> {
    let Query(query) = query.map_err(|e| rejection(e.body_text()))?;
    let schedules = state
        .plane
        .list(&query.facility_id)
        .await
        .map_err(api_error)?;
    Ok(Json(schedules))
}

/// Cancels a schedule.
///
/// `DELETE /load-shedding/{id}` → 204, 404 unknown, 409 already closed
pub async fn cancel_schedule(
    State(state): State<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(id) = id.map_err(|e| rejection(e.body_text()))?;
    state.plane.cancel(id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Accepts a grid demand-response event and allocates it across zones.
///
/// `POST /demand-response/events` → 200 + allocation; a redelivered event
/// returns the stored allocation with `duplicate: true`
pub async fn submit_dr_event(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DrEventBody>, JsonRejection>,
) -> Result<Json<DrAllocation>, ApiError> {
    let Json(body) = body.map_err(|e| rejection(e.body_text()))?;
    let event = DemandResponseEvent::try_from(body).map_err(api_error)?;
    let allocation = state
        .plane
        .demand_response(event)
        .await
        .map_err(api_error)?;
    Ok(Json(allocation))
}

/// Generates (or regenerates) the savings report for a period.
///
/// `POST /savings/reports` → 200 + report
pub async fn generate_report(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ReportBody>, JsonRejection>,
) -> Result<Json<SavingsReport>, ApiError> {
    let Json(body) = body.map_err(|e| rejection(e.body_text()))?;
    let report = state
        .savings
        .generate_report(&body.facility_id, body.period_start, body.period_end)
        .await
        .map_err(api_error)?;
    Ok(Json(report))
}

/// Returns cached reports, newest first.
///
/// `GET /savings/reports?facilityId=&limit=` → 200 + `Vec<SavingsReport>`
pub async fn recent_reports(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ReportsQuery>, QueryRejection>,
) -> Result<Json<Vec<SavingsReport>>, ApiError> {
    let Query(query) = query.map_err(|e| rejection(e.body_text()))?;
    let limit = query.limit.unwrap_or(DEFAULT_REPORT_LIMIT);
    if limit == 0 || limit > MAX_REPORT_LIMIT {
        return Err(rejection(format!(
            "limit must be between 1 and {MAX_REPORT_LIMIT}"
        )));
    }
    let reports = state
        .savings
        .recent_reports(&query.facility_id, limit)
        .await
        .map_err(api_error)?;
    Ok(Json(reports))
}

/// Recommendations from the report trend and schedule history.
///
/// `GET /savings/recommendations?facilityId=` → 200 + `Vec<Recommendation>`
pub async fn recommendations(
    State(state): State<Arc<AppState>>,
    query: Result<Query<FacilityQuery>, QueryRejection>,
) -> Result<Json<Vec<Recommendation>>, ApiError> {
    let Query(query) = query.map_err(|e| rejection(e.body_text()))?;
    let facility_id = query.facility_id.as_str();
    let found = state
        .store
        .facility(facility_id)
        .await
        .map_err(|e| api_error(e.into()))?;
    if found.is_none() {
        return Err(api_error(Error::not_found("facility", facility_id)));
    }
    let reports = state
        .savings
        .recent_reports(facility_id, DEFAULT_REPORT_LIMIT)
        .await
        .map_err(api_error)?;
    let schedules = state
        .store
        .schedules(facility_id)
        .await
        .map_err(|e| api_error(e.into()))?;
    Ok(Json(derive_recommendations(&reports, &schedules)))
}

/// `GET /health` → 200
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        facilities: state.plane.facility_ids().count(),
    })
}
