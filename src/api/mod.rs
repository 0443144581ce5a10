//! HTTP surface over the control plane and the savings engine.
//!
//! - `POST /load-shedding`, `GET /load-shedding?facilityId=`
//! - `DELETE /load-shedding/{id}`
//! - `POST /demand-response/events`
//! - `POST /savings/reports`, `GET /savings/reports?facilityId=&limit=`
//! - `GET /savings/recommendations?facilityId=`
//! - `GET /health`

mod handlers;
mod types;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use tracing::info;

use crate::ports::Store;
use crate::scheduler::ControlPlane;
use crate::verification::SavingsEngine;

pub use types::{CreateScheduleBody, DrEventBody, ErrorResponse, ReportBody};

/// Application state shared across all request handlers.
///
/// Schedule state lives in the control loops; handlers only hold handles
/// to them, so no lock is needed here.
pub struct AppState {
    pub plane: ControlPlane,
    pub savings: Arc<SavingsEngine>,
    /// Read side for history queries that do not go through a control loop.
    pub store: Arc<dyn Store>,
}

/// Builds the axum router with all API routes.
///
/// # Arguments
///
/// * `state` - Shared application state
///
/// # Returns
///
/// Configured `Router` ready to serve.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/load-shedding",
            post(handlers::create_schedule).get(handlers::list_schedules),
        )
        .route("/load-shedding/{id}", delete(handlers::cancel_schedule))
        .route("/demand-response/events", post(handlers::submit_dr_event))
        .route(
            "/savings/reports",
            post(handlers::generate_report).get(handlers::recent_reports),
        )
        .route("/savings/recommendations", get(handlers::recommendations))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Binds to the given address and serves the API until the server stops.
///
/// # Errors
///
/// Returns an `io::Error` if the listener cannot bind to `addr` or the
/// server fails.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");
    axum::serve(listener, app).await
}
