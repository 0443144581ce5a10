//! Interfaces to external collaborators: persistence, device actuation,
//! the sensor feed and alerting.
//!
//! All traits are object-safe via `async_trait` and shared as `Arc<dyn _>`.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::dr::DrAllocation;
use crate::model::{
    ActionKind, CropProfile, DemandResponseEvent, EnergyReading, EnvironmentSample, Facility,
    LoadSheddingSchedule, NonRoutineEvent, SavingsReport, Zone,
};
use crate::rates::RateSchedule;
use crate::safety::SafetyEnvelope;
use crate::scheduler::AuditEntry;

/// In-memory collaborator implementations for the demo binary and tests.
pub mod memory;

pub use memory::{
    AckMode, InMemoryStore, RecordingActuator, RecordingAlerter, SentCommand, StaticSensorFeed,
    TracingAlerter,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("operation timed out")]
    Timeout,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Runs a store call with a deadline; an overrun is [`StoreError::Timeout`].
pub async fn bounded<T>(
    limit: Duration,
    op: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(limit, op)
        .await
        .unwrap_or(Err(StoreError::Timeout))
}

/// Persistence over the records this subsystem reads and writes.
#[async_trait]
pub trait Store: Send + Sync {
    async fn facilities(&self) -> Result<Vec<Facility>, StoreError>;
    async fn facility(&self, id: &str) -> Result<Option<Facility>, StoreError>;
    async fn zones(&self, facility_id: &str) -> Result<Vec<Zone>, StoreError>;

    /// Every published version for the rate-zone.
    async fn rate_schedules(&self, rate_zone: &str) -> Result<Vec<RateSchedule>, StoreError>;
    async fn safety_envelope(
        &self,
        profile: &CropProfile,
    ) -> Result<Option<SafetyEnvelope>, StoreError>;

    async fn schedules(&self, facility_id: &str) -> Result<Vec<LoadSheddingSchedule>, StoreError>;
    async fn schedule(&self, id: Uuid) -> Result<Option<LoadSheddingSchedule>, StoreError>;
    async fn upsert_schedule(&self, schedule: &LoadSheddingSchedule) -> Result<(), StoreError>;

    async fn insert_dr_event(&self, event: &DemandResponseEvent) -> Result<(), StoreError>;
    /// Event ids are issued by the aggregator and only unique per facility.
    async fn dr_event(
        &self,
        facility_id: &str,
        id: &str,
    ) -> Result<Option<DemandResponseEvent>, StoreError>;
    async fn save_allocation(&self, allocation: &DrAllocation) -> Result<(), StoreError>;
    async fn allocation(
        &self,
        facility_id: &str,
        event_id: &str,
    ) -> Result<Option<DrAllocation>, StoreError>;

    /// Readings in `[from, to]`. `zone_id = None` returns every meter of the facility.
    async fn readings(
        &self,
        facility_id: &str,
        zone_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EnergyReading>, StoreError>;
    async fn append_readings(&self, readings: &[EnergyReading]) -> Result<(), StoreError>;
    async fn non_routine_events(&self, facility_id: &str)
    -> Result<Vec<NonRoutineEvent>, StoreError>;

    async fn save_report(&self, report: &SavingsReport) -> Result<(), StoreError>;
    /// Newest first.
    async fn recent_reports(
        &self,
        facility_id: &str,
        limit: usize,
    ) -> Result<Vec<SavingsReport>, StoreError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
    async fn audit_log(&self, facility_id: &str) -> Result<Vec<AuditEntry>, StoreError>;
}

pub type CommandId = String;

/// Setpoint sent to a zone's device controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActuationAction {
    Shed { kind: ActionKind, reduction_kw: f64 },
    Restore,
}

impl fmt::Display for ActuationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shed { kind, reduction_kw } => write!(f, "shed {reduction_kw:.1} kW ({kind:?})"),
            Self::Restore => f.write_str("restore"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Pending,
    Acked,
    Failed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActuationError {
    #[error("device interface unreachable: {0}")]
    Transport(String),
    #[error("unknown command {0}")]
    UnknownCommand(CommandId),
}

/// Abstract device-control interface. Commands are fire-and-forget; the
/// caller polls acknowledgement.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn send_command(
        &self,
        zone_id: &str,
        action: &ActuationAction,
        duration_seconds: u64,
    ) -> Result<CommandId, ActuationError>;

    async fn ack_status(&self, command_id: &str) -> Result<AckStatus, ActuationError>;
}

/// Read-only view of current zone conditions.
#[async_trait]
pub trait SensorFeed: Send + Sync {
    async fn latest(&self, zone_id: &str) -> Result<Option<EnvironmentSample>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub facility_id: String,
    pub severity: Severity,
    pub message: String,
}

/// User-visible notifications (safety cancellations, actuation failures).
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn emit_alert(&self, facility_id: &str, severity: Severity, message: &str);
}
