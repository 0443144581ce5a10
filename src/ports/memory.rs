use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    AckStatus, ActuationAction, ActuationError, Actuator, Alert, Alerter, CommandId, SensorFeed,
    Severity, Store, StoreError,
};
use crate::dr::DrAllocation;
use crate::model::{
    CropProfile, DemandResponseEvent, EnergyReading, EnvironmentSample, Facility, FacilityId,
    LoadSheddingSchedule, NonRoutineEvent, SavingsReport, Zone, ZoneId,
};
use crate::rates::RateSchedule;
use crate::safety::SafetyEnvelope;
use crate::scheduler::AuditEntry;

#[derive(Debug, Default)]
struct StoreState {
    facilities: BTreeMap<FacilityId, Facility>,
    zones: BTreeMap<ZoneId, Zone>,
    rate_schedules: Vec<RateSchedule>,
    envelopes: HashMap<CropProfile, SafetyEnvelope>,
    schedules: HashMap<Uuid, LoadSheddingSchedule>,
    dr_events: HashMap<(FacilityId, String), DemandResponseEvent>,
    allocations: HashMap<(FacilityId, String), DrAllocation>,
    readings: Vec<EnergyReading>,
    non_routine: Vec<NonRoutineEvent>,
    reports: Vec<SavingsReport>,
    audit: Vec<AuditEntry>,
}

/// Process-local [`Store`]. `set_unavailable(true)` makes every call fail
/// and `set_latency` delays every call, for exercising the outage paths.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_facility(&self, facility: Facility) {
        self.state
            .write()
            .facilities
            .insert(facility.id.clone(), facility);
    }

    pub fn insert_zone(&self, zone: Zone) {
        self.state.write().zones.insert(zone.id.clone(), zone);
    }

    pub fn publish_rate_schedule(&self, schedule: RateSchedule) {
        self.state.write().rate_schedules.push(schedule);
    }

    pub fn set_envelope(&self, profile: CropProfile, envelope: SafetyEnvelope) {
        self.state.write().envelopes.insert(profile, envelope);
    }

    pub fn add_non_routine_event(&self, event: NonRoutineEvent) {
        self.state.write().non_routine.push(event);
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    async fn check(&self) -> Result<(), StoreError> {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn facilities(&self) -> Result<Vec<Facility>, StoreError> {
        self.check().await?;
        Ok(self.state.read().facilities.values().cloned().collect())
    }

    async fn facility(&self, id: &str) -> Result<Option<Facility>, StoreError> {
        self.check().await?;
        Ok(self.state.read().facilities.get(id).cloned())
    }

    async fn zones(&self, facility_id: &str) -> Result<Vec<Zone>, StoreError> {
        self.check().await?;
        Ok(self
            .state
            .read()
            .zones
            .values()
            .filter(|z| z.facility_id == facility_id)
            .cloned()
            .collect())
    }

    async fn rate_schedules(&self, rate_zone: &str) -> Result<Vec<RateSchedule>, StoreError> {
        self.check().await?;
        Ok(self
            .state
            .read()
            .rate_schedules
            .iter()
            .filter(|s| s.rate_zone == rate_zone)
            .cloned()
            .collect())
    }

    async fn safety_envelope(
        &self,
        profile: &CropProfile,
    ) -> Result<Option<SafetyEnvelope>, StoreError> {
        self.check().await?;
        Ok(self.state.read().envelopes.get(profile).cloned())
    }

    async fn schedules(&self, facility_id: &str) -> Result<Vec<LoadSheddingSchedule>, StoreError> {
        self.check().await?;
        let mut out: Vec<_> = self
            .state
            .read()
            .schedules
            .values()
            .filter(|s| s.facility_id == facility_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| (s.created_at, s.id));
        Ok(out)
    }

    async fn schedule(&self, id: Uuid) -> Result<Option<LoadSheddingSchedule>, StoreError> {
        self.check().await?;
        Ok(self.state.read().schedules.get(&id).cloned())
    }

    async fn upsert_schedule(&self, schedule: &LoadSheddingSchedule) -> Result<(), StoreError> {
        self.check().await?;
        self.state
            .write()
            .schedules
            .insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn insert_dr_event(&self, event: &DemandResponseEvent) -> Result<(), StoreError> {
        self.check().await?;
        self.state
            .write()
            .dr_events
            .insert((event.facility_id.clone(), event.id.clone()), event.clone());
        Ok(())
    }

    async fn dr_event(
        &self,
        facility_id: &str,
        id: &str,
    ) -> Result<Option<DemandResponseEvent>, StoreError> {
        self.check().await?;
        let key = (facility_id.to_string(), id.to_string());
        Ok(self.state.read().dr_events.get(&key).cloned())
    }

    async fn save_allocation(&self, allocation: &DrAllocation) -> Result<(), StoreError> {
        self.check().await?;
        self.state
            .write()
            .allocations
            .insert(
                (allocation.facility_id.clone(), allocation.event_id.clone()),
                allocation.clone(),
            );
        Ok(())
    }

    async fn allocation(
        &self,
        facility_id: &str,
        event_id: &str,
    ) -> Result<Option<DrAllocation>, StoreError> {
        self.check().await?;
        let key = (facility_id.to_string(), event_id.to_string());
        Ok(self.state.read().allocations.get(&key).cloned())
    }

    async fn readings(
        &self,
        facility_id: &str,
        zone_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EnergyReading>, StoreError> {
        self.check().await?;
        let mut out: Vec<_> = self
            .state
            .read()
            .readings
            .iter()
            .filter(|r| r.facility_id == facility_id)
            .filter(|r| zone_id.is_none_or(|z| r.zone_id.as_deref() == Some(z)))
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.zone_id.cmp(&b.zone_id))
        });
        Ok(out)
    }

    async fn append_readings(&self, readings: &[EnergyReading]) -> Result<(), StoreError> {
        self.check().await?;
        self.state.write().readings.extend_from_slice(readings);
        Ok(())
    }

    async fn non_routine_events(
        &self,
        facility_id: &str,
    ) -> Result<Vec<NonRoutineEvent>, StoreError> {
        self.check().await?;
        Ok(self
            .state
            .read()
            .non_routine
            .iter()
            .filter(|e| e.facility_id == facility_id)
            .cloned()
            .collect())
    }

    async fn save_report(&self, report: &SavingsReport) -> Result<(), StoreError> {
        self.check().await?;
        let mut state = self.state.write();
        // one cached report per facility and period
        state.reports.retain(|r| {
            !(r.facility_id == report.facility_id
                && r.period_start == report.period_start
                && r.period_end == report.period_end)
        });
        state.reports.push(report.clone());
        Ok(())
    }

    async fn recent_reports(
        &self,
        facility_id: &str,
        limit: usize,
    ) -> Result<Vec<SavingsReport>, StoreError> {
        self.check().await?;
        let mut out: Vec<_> = self
            .state
            .read()
            .reports
            .iter()
            .filter(|r| r.facility_id == facility_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.period_end
                .cmp(&a.period_end)
                .then_with(|| b.generated_at.cmp(&a.generated_at))
        });
        out.truncate(limit);
        Ok(out)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.check().await?;
        self.state.write().audit.push(entry.clone());
        Ok(())
    }

    async fn audit_log(&self, facility_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        self.check().await?;
        Ok(self
            .state
            .read()
            .audit
            .iter()
            .filter(|e| e.facility_id == facility_id)
            .cloned()
            .collect())
    }
}

/// How [`RecordingActuator`] answers acknowledgement polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Every command is acknowledged as soon as it is polled.
    Immediate,
    /// Commands stay PENDING forever.
    Never,
    /// The first `n` commands fail, later ones are acknowledged.
    FailFirst(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentCommand {
    pub id: CommandId,
    pub zone_id: ZoneId,
    pub action: ActuationAction,
    pub duration_seconds: u64,
}

/// [`Actuator`] that records every command and acknowledges per [`AckMode`].
#[derive(Debug)]
pub struct RecordingActuator {
    mode: Mutex<AckMode>,
    sent: Mutex<Vec<SentCommand>>,
    statuses: Mutex<HashMap<CommandId, AckStatus>>,
    next_id: AtomicU64,
}

impl Default for RecordingActuator {
    fn default() -> Self {
        Self::new(AckMode::Immediate)
    }
}

impl RecordingActuator {
    pub fn new(mode: AckMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            sent: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_mode(&self, mode: AckMode) {
        *self.mode.lock() = mode;
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, zone_id: &str) -> Vec<SentCommand> {
        self.sent
            .lock()
            .iter()
            .filter(|c| c.zone_id == zone_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Actuator for RecordingActuator {
    async fn send_command(
        &self,
        zone_id: &str,
        action: &ActuationAction,
        duration_seconds: u64,
    ) -> Result<CommandId, ActuationError> {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("cmd-{seq}");
        let status = match *self.mode.lock() {
            AckMode::Immediate => AckStatus::Acked,
            AckMode::Never => AckStatus::Pending,
            AckMode::FailFirst(n) if seq <= u64::from(n) => AckStatus::Failed,
            AckMode::FailFirst(_) => AckStatus::Acked,
        };
        self.statuses.lock().insert(id.clone(), status);
        self.sent.lock().push(SentCommand {
            id: id.clone(),
            zone_id: zone_id.to_string(),
            action: action.clone(),
            duration_seconds,
        });
        Ok(id)
    }

    async fn ack_status(&self, command_id: &str) -> Result<AckStatus, ActuationError> {
        self.statuses
            .lock()
            .get(command_id)
            .copied()
            .ok_or_else(|| ActuationError::UnknownCommand(command_id.to_string()))
    }
}

/// [`SensorFeed`] serving whatever samples were last set.
#[derive(Debug, Default)]
pub struct StaticSensorFeed {
    samples: RwLock<HashMap<ZoneId, EnvironmentSample>>,
}

impl StaticSensorFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, sample: EnvironmentSample) {
        self.samples.write().insert(sample.zone_id.clone(), sample);
    }

    pub fn clear(&self, zone_id: &str) {
        self.samples.write().remove(zone_id);
    }
}

#[async_trait]
impl SensorFeed for StaticSensorFeed {
    async fn latest(&self, zone_id: &str) -> Result<Option<EnvironmentSample>, StoreError> {
        Ok(self.samples.read().get(zone_id).cloned())
    }
}

#[derive(Debug, Default)]
pub struct RecordingAlerter {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn emit_alert(&self, facility_id: &str, severity: Severity, message: &str) {
        self.alerts.lock().push(Alert {
            facility_id: facility_id.to_string(),
            severity,
            message: message.to_string(),
        });
    }
}

/// Writes alerts to the log; the default when no notification channel is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlerter;

#[async_trait]
impl Alerter for TracingAlerter {
    async fn emit_alert(&self, facility_id: &str, severity: Severity, message: &str) {
        match severity {
            Severity::Critical => error!(facility_id, "ALERT: {message}"),
            Severity::Warning => warn!(facility_id, "ALERT: {message}"),
            Severity::Info => info!(facility_id, "ALERT: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};

    use super::*;
    use crate::model::ActionKind;
    use crate::ports::bounded;

    fn reading(zone: Option<&str>, hour: u32) -> EnergyReading {
        EnergyReading {
            facility_id: "f".to_string(),
            zone_id: zone.map(str::to_string),
            timestamp: Utc.with_ymd_and_hms(2026, 7, 1, hour, 0, 0).unwrap(),
            power_kw: 10.0,
            cumulative_kwh: f64::from(hour) * 10.0,
            cost: 0.0,
        }
    }

    #[tokio::test]
    async fn readings_filter_by_zone_and_range() {
        let store = InMemoryStore::new();
        store
            .append_readings(&[
                reading(None, 3),
                reading(Some("z1"), 1),
                reading(Some("z1"), 2),
                reading(Some("z2"), 2),
            ])
            .await
            .unwrap();
        let from = Utc.with_ymd_and_hms(2026, 7, 1, 2, 0, 0).unwrap();
        let to = from + TimeDelta::hours(2);

        let z1 = store.readings("f", Some("z1"), from, to).await.unwrap();
        assert_eq!(z1.len(), 1);

        let all = store.readings("f", None, from, to).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.facilities().await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.facilities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_store_overruns_a_bounded_call() {
        let store = InMemoryStore::new();
        store.set_latency(Duration::from_millis(200));
        let slow = bounded(Duration::from_millis(10), store.facilities()).await;
        assert_eq!(slow.unwrap_err(), StoreError::Timeout);

        store.set_latency(Duration::ZERO);
        let fast = bounded(Duration::from_millis(200), store.facilities()).await;
        assert!(fast.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_first_mode_fails_then_acks() {
        let actuator = RecordingActuator::new(AckMode::FailFirst(1));
        let shed = ActuationAction::Shed {
            kind: ActionKind::ReduceLight,
            reduction_kw: 5.0,
        };
        let first = actuator.send_command("z1", &shed, 60).await.unwrap();
        let second = actuator.send_command("z1", &shed, 60).await.unwrap();
        assert_eq!(actuator.ack_status(&first).await.unwrap(), AckStatus::Failed);
        assert_eq!(actuator.ack_status(&second).await.unwrap(), AckStatus::Acked);
        assert_eq!(actuator.sent_to("z1").len(), 2);
        assert!(actuator.ack_status("cmd-99").await.is_err());
    }
}
