//! Error taxonomy shared by the scheduler, DR handler and verification engine.

use thiserror::Error;
use uuid::Uuid;

use crate::ports::StoreError;

/// Synchronous failures returned to callers.
///
/// Safety violations and actuation failures are not represented here: they
/// happen asynchronously inside the control loop and are delivered through
/// the alerting interface and the schedule record instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid rate schedule, safety envelope or site data.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Requested shed exceeds what the zone can deliver.
    #[error(
        "capacity exceeded on zone {zone_id}: requested {requested_kw:.1} kW, \
         {available_kw:.1} kW available"
    )]
    CapacityExceeded {
        zone_id: String,
        requested_kw: f64,
        available_kw: f64,
    },

    /// Schedule is already COMPLETED/CANCELLED or past its end time.
    #[error("schedule {id} can no longer be cancelled ({status})")]
    ScheduleClosed { id: Uuid, status: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Request failed validation at the input boundary.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Control loop is gone or did not answer in time.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
