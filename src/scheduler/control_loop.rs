//! Per-facility control task and the registry that routes requests to it.
//!
//! Each facility gets one [`ControlLoop`] task that owns its
//! [`FacilityScheduler`]. API calls and grid events reach it through a
//! [`FacilityHandle`] as messages carrying a oneshot reply, so schedule
//! state has exactly one writer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::lifecycle::{FacilityScheduler, SchedulerSettings, TickOutcome};
use super::optimizer::{CostOptimizer, OptimizerSettings};
use crate::clock::Clock;
use crate::dedup::{self, DedupCache};
use crate::dr::{DemandResponseHandler, DrAllocation, DrSettings};
use crate::error::{Error, Result};
use crate::model::{
    DemandResponseEvent, FacilityId, LoadSheddingSchedule, ShedRequest, ZoneId,
};
use crate::ports::{
    AckStatus, ActuationError, Actuator, Alerter, SensorFeed, Store, StoreError, bounded,
};
use crate::rates::RateBook;
use crate::retry::RetryPolicy;
use crate::verification::SavingsEngine;

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub tick_interval: Duration,
    /// Bound on every sensor, store and actuator call.
    pub io_timeout: Duration,
    /// How long a caller waits for the loop to answer.
    pub reply_timeout: Duration,
    pub inbox_capacity: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            io_timeout: Duration::from_millis(2_000),
            reply_timeout: Duration::from_secs(10),
            inbox_capacity: 64,
        }
    }
}

/// Everything a facility's control loop is configured with.
#[derive(Debug, Clone, Default)]
pub struct ControlSettings {
    pub scheduler: SchedulerSettings,
    pub optimizer: OptimizerSettings,
    pub dr: DrSettings,
    pub timing: LoopSettings,
}

/// Shared collaborators handed to every control loop.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub actuator: Arc<dyn Actuator>,
    pub sensors: Arc<dyn SensorFeed>,
    pub alerter: Arc<dyn Alerter>,
    pub clock: Arc<dyn Clock>,
    pub dedup: Arc<dyn DedupCache>,
    pub savings: Arc<SavingsEngine>,
}

enum Command {
    Create {
        request: ShedRequest,
        reply: oneshot::Sender<Result<LoadSheddingSchedule>>,
    },
    Cancel {
        id: Uuid,
        reply: oneshot::Sender<Result<LoadSheddingSchedule>>,
    },
    List {
        reply: oneshot::Sender<Vec<LoadSheddingSchedule>>,
    },
    DemandResponse {
        event: DemandResponseEvent,
        reply: oneshot::Sender<Result<DrAllocation>>,
    },
    Tick {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable sender side of one facility's control loop.
#[derive(Debug, Clone)]
pub struct FacilityHandle {
    facility_id: FacilityId,
    inbox: mpsc::Sender<Command>,
    reply_timeout: Duration,
}

impl FacilityHandle {
    pub fn facility_id(&self) -> &str {
        &self.facility_id
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        let exchange = async {
            self.inbox
                .send(make(tx))
                .await
                .map_err(|_| self.stopped())?;
            rx.await.map_err(|_| self.stopped())
        };
        tokio::time::timeout(self.reply_timeout, exchange)
            .await
            .map_err(|_| {
                Error::Unavailable(format!(
                    "control loop for facility {} did not answer within {:?}",
                    self.facility_id, self.reply_timeout
                ))
            })?
    }

    fn stopped(&self) -> Error {
        Error::Unavailable(format!(
            "control loop for facility {} has stopped",
            self.facility_id
        ))
    }

    /// Creates a PENDING schedule.
    ///
    /// # Errors
    ///
    /// Scheduler validation errors, [`Error::Store`] if the new record
    /// cannot be persisted and [`Error::Unavailable`] if the loop is gone.
    pub async fn create(&self, request: ShedRequest) -> Result<LoadSheddingSchedule> {
        self.request(|reply| Command::Create { request, reply })
            .await?
    }

    /// Cancels an open schedule on user request.
    ///
    /// # Errors
    ///
    /// [`Error::ScheduleClosed`] if it already finished or its window
    /// ended, [`Error::NotFound`] if it never existed.
    pub async fn cancel(&self, id: Uuid) -> Result<LoadSheddingSchedule> {
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    /// PENDING and ACTIVE schedules.
    ///
    /// # Errors
    ///
    /// [`Error::Unavailable`] if the loop is gone.
    pub async fn list(&self) -> Result<Vec<LoadSheddingSchedule>> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Allocates a demand-response event over the facility's zones.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for an event that already ended, or
    /// [`Error::Store`] when the duplicate check cannot read the original.
    pub async fn demand_response(&self, event: DemandResponseEvent) -> Result<DrAllocation> {
        self.request(|reply| Command::DemandResponse { event, reply })
            .await?
    }

    /// Runs one control step now instead of waiting for the interval.
    ///
    /// # Errors
    ///
    /// [`Error::Unavailable`] if the loop is gone.
    pub async fn tick(&self) -> Result<()> {
        self.request(|reply| Command::Tick { reply }).await
    }
}

/// The task that owns one facility's scheduler.
pub struct ControlLoop {
    scheduler: FacilityScheduler,
    optimizer: CostOptimizer,
    dr: DemandResponseHandler,
    deps: Collaborators,
    timing: LoopSettings,
    inbox: mpsc::Receiver<Command>,
}

impl ControlLoop {
    /// Spawns the loop on the current tokio runtime.
    ///
    /// The loop runs until every [`FacilityHandle`] is dropped.
    pub fn spawn(
        scheduler: FacilityScheduler,
        optimizer: CostOptimizer,
        dr: DemandResponseHandler,
        deps: Collaborators,
        timing: LoopSettings,
    ) -> (FacilityHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(timing.inbox_capacity.max(1));
        let handle = FacilityHandle {
            facility_id: scheduler.facility().id.clone(),
            inbox: tx,
            reply_timeout: timing.reply_timeout,
        };
        let control = Self {
            scheduler,
            optimizer,
            dr,
            deps,
            timing,
            inbox: rx,
        };
        (handle, tokio::spawn(control.run()))
    }

    fn facility_id(&self) -> &str {
        &self.scheduler.facility().id
    }

    fn retry(&self) -> &RetryPolicy {
        &self.scheduler.settings().retry
    }

    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.timing.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            facility_id = %self.facility_id(),
            interval = ?self.timing.tick_interval,
            "control loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                command = self.inbox.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        info!(facility_id = %self.facility_id(), "control loop stopped");
    }

    async fn handle(&mut self, command: Command) {
        // a caller that gave up waiting has dropped its receiver; nothing to do
        match command {
            Command::Create { request, reply } => {
                let _ = reply.send(self.create(request).await);
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id).await);
            }
            Command::List { reply } => {
                let open = self
                    .scheduler
                    .open_schedules()
                    .into_iter()
                    .cloned()
                    .collect();
                let _ = reply.send(open);
            }
            Command::DemandResponse { event, reply } => {
                let _ = reply.send(self.demand_response(event).await);
            }
            Command::Tick { reply } => {
                self.tick().await;
                let _ = reply.send(());
            }
        }
    }

    async fn create(&mut self, request: ShedRequest) -> Result<LoadSheddingSchedule> {
        let now = self.deps.clock.now();
        let (schedule, outcome) = self.scheduler.submit(request, Uuid::new_v4(), now)?;
        if let Err(err) = self.apply(outcome, now).await {
            self.scheduler.forget(schedule.id);
            return Err(err.into());
        }
        Ok(schedule)
    }

    async fn cancel(&mut self, id: Uuid) -> Result<LoadSheddingSchedule> {
        let now = self.deps.clock.now();
        match self.scheduler.cancel(id, now) {
            Ok((schedule, outcome)) => {
                self.apply(outcome, now).await?;
                Ok(schedule)
            }
            Err(Error::NotFound { .. }) => {
                let stored = bounded(self.timing.io_timeout, self.deps.store.schedule(id)).await?;
                match stored {
                    Some(s) if s.facility_id == self.facility_id() => Err(Error::ScheduleClosed {
                        id,
                        status: s.status.to_string(),
                    }),
                    _ => Err(Error::not_found("schedule", id.to_string())),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn demand_response(&mut self, mut event: DemandResponseEvent) -> Result<DrAllocation> {
        let now = self.deps.clock.now();
        let io = self.timing.io_timeout;

        let key = dedup::event_key(&event.facility_id, &event.id);
        let fresh = self.deps.dedup.check_and_insert(&key, now);
        // The dedup window can lapse before a day-ahead event runs; the stored
        // allocation is authoritative.
        let stored = bounded(io, self.deps.store.allocation(&event.facility_id, &event.id)).await?;
        if let Some(mut original) = stored {
            info!(
                event_id = %event.id,
                cache_hit = !fresh,
                "duplicate demand-response event, returning original allocation"
            );
            original.duplicate = true;
            return Ok(original);
        }
        if !fresh {
            debug!(event_id = %event.id, "event id seen but never allocated, handling as new");
        }

        let (allocation, outcome) = self.dr.allocate(&mut self.scheduler, &event, now)?;
        event.acknowledged_at = Some(now);

        let store = Arc::clone(&self.deps.store);
        if let Err(err) = self
            .retry()
            .run("store demand-response event", || bounded(io, store.insert_dr_event(&event)))
            .await
        {
            error!(event_id = %event.id, "failed to persist demand-response event: {err}");
        }
        self.apply(outcome, now).await?;
        self.retry()
            .run("store allocation", || bounded(io, store.save_allocation(&allocation)))
            .await?;
        Ok(allocation)
    }

    /// One control step. Skipped when sensor or acknowledgement reads time out.
    async fn tick(&mut self) {
        let now = self.deps.clock.now();
        let io = self.timing.io_timeout;
        let facility_id = self.facility_id().to_string();

        let zone_ids: Vec<ZoneId> = self.scheduler.zones().map(|z| z.id.clone()).collect();
        let mut samples = HashMap::new();
        for zone_id in zone_ids {
            match tokio::time::timeout(io, self.deps.sensors.latest(&zone_id)).await {
                Ok(Ok(Some(sample))) => {
                    samples.insert(zone_id, sample);
                }
                Ok(Ok(None)) => debug!(%zone_id, "no environment sample"),
                Ok(Err(err)) => warn!(%zone_id, "sensor read failed: {err}"),
                Err(_) => {
                    warn!(%facility_id, %zone_id, "sensor read timed out, skipping tick");
                    return;
                }
            }
        }

        let mut acks = HashMap::new();
        for command_id in self.scheduler.outstanding_commands() {
            match tokio::time::timeout(io, self.deps.actuator.ack_status(&command_id)).await {
                Ok(Ok(status)) => {
                    acks.insert(command_id, status);
                }
                Ok(Err(ActuationError::UnknownCommand(_))) => {
                    acks.insert(command_id, AckStatus::Failed);
                }
                Ok(Err(err)) => warn!(%command_id, "acknowledgement poll failed: {err}"),
                Err(_) => {
                    warn!(
                        %facility_id,
                        %command_id,
                        "acknowledgement poll timed out, skipping tick"
                    );
                    return;
                }
            }
        }

        let mut outcome = self.scheduler.tick(now, &samples, &acks);
        for request in self.optimizer.plan(&self.scheduler, now) {
            match self.scheduler.submit(request, Uuid::new_v4(), now) {
                Ok((_, effects)) => outcome.merge(effects),
                Err(err) => debug!(%facility_id, "cost-optimization plan not admitted: {err}"),
            }
        }

        let evicted = self.deps.dedup.evict_expired(now);
        if evicted > 0 {
            debug!(evicted, "expired demand-response event ids");
        }

        if outcome.is_empty() && outcome.completed.is_empty() {
            return;
        }
        if let Err(err) = self.apply(outcome, now).await {
            error!(%facility_id, "tick effects not fully persisted: {err}");
        }
    }

    /// Carries out a scheduler step's side effects. Every effect is attempted;
    /// the first schedule persistence failure is returned.
    async fn apply(
        &mut self,
        outcome: TickOutcome,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), StoreError> {
        let io = self.timing.io_timeout;
        let facility_id = self.facility_id().to_string();
        let retry = self.retry().clone();
        let store = Arc::clone(&self.deps.store);

        let mut first_failure = None;
        for schedule in &outcome.changed {
            if let Err(err) = retry
                .run("persist schedule", || bounded(io, store.upsert_schedule(schedule)))
                .await
            {
                error!(schedule_id = %schedule.id, "failed to persist schedule: {err}");
                first_failure.get_or_insert(err);
            }
        }
        for entry in &outcome.audit {
            if let Err(err) = retry
                .run("append audit entry", || bounded(io, store.append_audit(entry)))
                .await
            {
                error!(schedule_id = %entry.schedule_id, "failed to append audit entry: {err}");
            }
        }

        for command in outcome.commands {
            let send = self.deps.actuator.send_command(
                &command.zone_id,
                &command.action,
                command.duration_seconds,
            );
            match tokio::time::timeout(io, send).await {
                Ok(Ok(command_id)) => {
                    debug!(
                        zone_id = %command.zone_id,
                        %command_id,
                        attempt = command.attempt,
                        "sent {}",
                        command.action
                    );
                    self.scheduler.record_sent(&command.zone_id, command_id, now);
                }
                Ok(Err(err)) => warn!(zone_id = %command.zone_id, "actuation send failed: {err}"),
                Err(_) => warn!(zone_id = %command.zone_id, "actuation send timed out"),
            }
        }

        for alert in outcome.alerts {
            let emit = self
                .deps
                .alerter
                .emit_alert(&facility_id, alert.severity, &alert.message);
            if tokio::time::timeout(io, emit).await.is_err() {
                error!(%facility_id, "alert delivery timed out: {}", alert.message);
            }
        }

        for schedule in outcome.completed {
            let savings = Arc::clone(&self.deps.savings);
            let facility_id = facility_id.clone();
            tokio::spawn(async move {
                if let Err(err) = savings
                    .generate_report(&facility_id, schedule.start_time, schedule.end_time)
                    .await
                {
                    warn!(schedule_id = %schedule.id, "savings recompute failed: {err}");
                }
            });
        }

        first_failure.map_or(Ok(()), Err)
    }
}

/// Routes requests to the control loop of each facility.
pub struct ControlPlane {
    store: Arc<dyn Store>,
    io_timeout: Duration,
    handles: BTreeMap<FacilityId, FacilityHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    /// Loads every facility from the store and starts its control loop.
    ///
    /// Zones without a safety envelope are loaded but cannot be shed.
    ///
    /// # Errors
    ///
    /// [`Error::Store`] if site data cannot be read and
    /// [`Error::Configuration`] for an invalid timezone.
    pub async fn start(deps: Collaborators, settings: ControlSettings) -> Result<Self> {
        let store = Arc::clone(&deps.store);
        let mut handles = BTreeMap::new();
        let mut tasks = Vec::new();

        for facility in store.facilities().await? {
            let mut zones = Vec::new();
            for zone in store.zones(&facility.id).await? {
                let envelope = store.safety_envelope(&zone.crop_profile).await?;
                if envelope.is_none() {
                    warn!(
                        facility_id = %facility.id,
                        zone_id = %zone.id,
                        crop = %zone.crop_profile.crop,
                        stage = %zone.crop_profile.stage,
                        "no safety envelope for crop profile, zone cannot be shed"
                    );
                }
                zones.push((zone, envelope));
            }
            let tariffs = store.rate_schedules(&facility.rate_zone).await?;
            let rates = RateBook::for_facility(&facility, tariffs)?;
            let open = store.schedules(&facility.id).await?;

            let facility_id = facility.id.clone();
            let mut scheduler =
                FacilityScheduler::new(facility, zones, rates, settings.scheduler.clone());
            scheduler.restore(open);

            let (handle, task) = ControlLoop::spawn(
                scheduler,
                CostOptimizer::new(settings.optimizer.clone()),
                DemandResponseHandler::new(&settings.dr),
                deps.clone(),
                settings.timing.clone(),
            );
            handles.insert(facility_id, handle);
            tasks.push(task);
        }
        info!(facilities = handles.len(), "control plane started");
        Ok(Self {
            store,
            io_timeout: settings.timing.io_timeout,
            handles,
            tasks,
        })
    }

    pub fn facility_ids(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }

    /// # Errors
    ///
    /// [`Error::NotFound`] for a facility without a control loop.
    pub fn facility(&self, facility_id: &str) -> Result<&FacilityHandle> {
        self.handles
            .get(facility_id)
            .ok_or_else(|| Error::not_found("facility", facility_id))
    }

    /// # Errors
    ///
    /// See [`FacilityHandle::create`].
    pub async fn create(&self, request: ShedRequest) -> Result<LoadSheddingSchedule> {
        self.facility(&request.facility_id)?.create(request).await
    }

    /// Cancels a schedule wherever it lives.
    ///
    /// # Errors
    ///
    /// See [`FacilityHandle::cancel`].
    pub async fn cancel(&self, id: Uuid) -> Result<LoadSheddingSchedule> {
        let schedule = bounded(self.io_timeout, self.store.schedule(id))
            .await?
            .ok_or_else(|| Error::not_found("schedule", id.to_string()))?;
        self.facility(&schedule.facility_id)?.cancel(id).await
    }

    /// # Errors
    ///
    /// See [`FacilityHandle::list`].
    pub async fn list(&self, facility_id: &str) -> Result<Vec<LoadSheddingSchedule>> {
        self.facility(facility_id)?.list().await
    }

    /// # Errors
    ///
    /// See [`FacilityHandle::demand_response`].
    pub async fn demand_response(&self, event: DemandResponseEvent) -> Result<DrAllocation> {
        self.facility(&event.facility_id)?
            .demand_response(event)
            .await
    }

    /// Runs one control step on every facility.
    ///
    /// # Errors
    ///
    /// The first [`Error::Unavailable`] from a stopped loop.
    pub async fn tick_all(&self) -> Result<()> {
        for handle in self.handles.values() {
            handle.tick().await?;
        }
        Ok(())
    }

    /// Drops every handle and waits for the loops to drain.
    pub async fn shutdown(self) {
        drop(self.handles);
        for task in self.tasks {
            if let Err(err) = task.await {
                error!("control loop panicked: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};

    use super::*;
    use crate::baseline::BaselineEstimator;
    use crate::clock::ManualClock;
    use crate::dedup::InMemoryDedup;
    use crate::model::{
        ActionKind, CropProfile, EnvironmentSample, Facility, Priority, ScheduleStatus,
        ShedReason, Zone, ZoneState, ZoneThermal,
    };
    use crate::ports::{
        ActuationAction, AckMode, InMemoryStore, RecordingActuator, RecordingAlerter,
        StaticSensorFeed,
    };
    use crate::safety::SafetyEnvelope;
    use crate::verification::VerificationSettings;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, h, m, 0).unwrap()
    }

    struct Rig {
        store: Arc<InMemoryStore>,
        actuator: Arc<RecordingActuator>,
        sensors: Arc<StaticSensorFeed>,
        clock: Arc<ManualClock>,
        plane: ControlPlane,
    }

    fn sample(now: DateTime<Utc>) -> EnvironmentSample {
        EnvironmentSample {
            zone_id: "z1".to_string(),
            observed_at: now,
            temp_c: 22.0,
            humidity_pct: 60.0,
            dli_today: 12.0,
            planned_dli_remaining: 8.0,
            dark_hours: 0.0,
            lights_on: true,
        }
    }

    async fn rig() -> Rig {
        rig_with_dedup(TimeDelta::hours(24)).await
    }

    /// Facilities `f1` (zone `z1`) and `f2` (zone `z2`), 100 kW zones.
    async fn rig_with_dedup(dedup_window: TimeDelta) -> Rig {
        let store = Arc::new(InMemoryStore::new());
        for (facility_id, zone_id) in [("f1", "z1"), ("f2", "z2")] {
            store.insert_facility(Facility {
                id: facility_id.to_string(),
                timezone: "UTC".to_string(),
                rate_zone: "rz".to_string(),
                emissions_region: None,
            });
            store.insert_zone(Zone {
                id: zone_id.to_string(),
                facility_id: facility_id.to_string(),
                capacity_kw: 100.0,
                lighting_kw: 80.0,
                crop_profile: CropProfile::new("lettuce", "vegetative"),
                thermal: ZoneThermal::default(),
                state: ZoneState::Normal,
            });
        }
        store.set_envelope(
            CropProfile::new("lettuce", "vegetative"),
            SafetyEnvelope {
                min_temp_c: 15.0,
                max_temp_c: 30.0,
                min_humidity_pct: 40.0,
                max_humidity_pct: 90.0,
                min_dli: 10.0,
                max_continuous_dark_hours: 12.0,
            },
        );

        let clock = Arc::new(ManualClock::new(at(9, 0)));
        let actuator = Arc::new(RecordingActuator::new(AckMode::Immediate));
        let sensors = Arc::new(StaticSensorFeed::new());
        let savings = Arc::new(SavingsEngine::new(
            store.clone(),
            clock.clone(),
            BaselineEstimator::default(),
            VerificationSettings::default(),
            RetryPolicy::default(),
        ));
        let deps = Collaborators {
            store: store.clone(),
            actuator: actuator.clone(),
            sensors: sensors.clone(),
            alerter: Arc::new(RecordingAlerter::new()),
            clock: clock.clone(),
            dedup: Arc::new(InMemoryDedup::new(dedup_window, 128)),
            savings,
        };
        let settings = ControlSettings {
            timing: LoopSettings {
                tick_interval: Duration::from_secs(3_600),
                io_timeout: Duration::from_millis(100),
                ..LoopSettings::default()
            },
            ..ControlSettings::default()
        };
        let plane = ControlPlane::start(deps, settings).await.unwrap();
        Rig {
            store,
            actuator,
            sensors,
            clock,
            plane,
        }
    }

    fn request(kw: f64) -> ShedRequest {
        ShedRequest::new(
            "f1",
            "z1",
            at(14, 0),
            at(16, 0),
            kw,
            Priority::Medium,
            ShedReason::PeakDemand,
            ActionKind::ReduceLight,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn created_schedule_is_persisted_and_actuated() {
        let rig = rig().await;
        let created = rig.plane.create(request(30.0)).await.unwrap();
        assert_eq!(created.status, ScheduleStatus::Pending);
        assert!(rig.store.schedule(created.id).await.unwrap().is_some());

        rig.clock.set(at(14, 0));
        rig.sensors.set(sample(at(14, 0)));
        rig.plane.tick_all().await.unwrap();

        let stored = rig.store.schedule(created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Active);
        let sent = rig.actuator.sent_to("z1");
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].action,
            ActuationAction::Shed {
                kind: ActionKind::ReduceLight,
                reduction_kw: 30.0
            }
        );
        rig.plane.shutdown().await;
    }

    #[tokio::test]
    async fn cancelling_a_closed_schedule_is_rejected() {
        let rig = rig().await;
        let created = rig.plane.create(request(30.0)).await.unwrap();
        rig.plane.cancel(created.id).await.unwrap();

        let err = rig.plane.cancel(created.id).await.unwrap_err();
        assert!(matches!(err, Error::ScheduleClosed { .. }));
        let err = rig.plane.cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        rig.plane.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_lookup_is_bounded_by_io_timeout() {
        let rig = rig().await;
        let created = rig.plane.create(request(30.0)).await.unwrap();

        rig.store.set_latency(Duration::from_millis(500));
        let err = rig.plane.cancel(created.id).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Timeout)));

        rig.store.set_latency(Duration::ZERO);
        let cancelled = rig.plane.cancel(created.id).await.unwrap();
        assert_eq!(cancelled.status, ScheduleStatus::Cancelled);
        rig.plane.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_event_returns_original_allocation() {
        let rig = rig().await;
        let event = DemandResponseEvent::new(
            "evt-1",
            "f1",
            "utility",
            at(15, 0),
            at(17, 0),
            40.0,
            0.5,
        )
        .unwrap();

        let first = rig.plane.demand_response(event.clone()).await.unwrap();
        assert!(!first.duplicate);
        assert_eq!(first.achieved_kw, 40.0);

        let again = rig.plane.demand_response(event).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(again.schedules, first.schedules);
        assert_eq!(rig.plane.list("f1").await.unwrap().len(), 1);
        let stored = rig.store.dr_event("f1", "evt-1").await.unwrap().unwrap();
        assert!(stored.acknowledged_at.is_some());
        rig.plane.shutdown().await;
    }

    fn dr_event(id: &str, facility_id: &str, kw: f64) -> DemandResponseEvent {
        DemandResponseEvent::new(id, facility_id, "aggregator", at(15, 0), at(17, 0), kw, 0.5)
            .unwrap()
    }

    #[tokio::test]
    async fn shared_event_id_is_allocated_per_facility() {
        let rig = rig().await;

        let a1 = rig
            .plane
            .demand_response(dr_event("agg-evt-7", "f1", 50.0))
            .await
            .unwrap();
        let a2 = rig
            .plane
            .demand_response(dr_event("agg-evt-7", "f2", 50.0))
            .await
            .unwrap();

        assert!(!a1.duplicate);
        assert!(!a2.duplicate);
        assert_eq!(a2.facility_id, "f2");
        assert_eq!(a2.achieved_kw, 50.0);
        assert!(a2.schedules.iter().all(|s| s.zone_id == "z2"));
        assert_eq!(rig.plane.list("f1").await.unwrap().len(), 1);
        assert_eq!(rig.plane.list("f2").await.unwrap().len(), 1);

        let stored = rig.store.allocation("f1", "agg-evt-7").await.unwrap().unwrap();
        assert_eq!(stored.facility_id, "f1");
        assert!(rig.store.dr_event("f2", "agg-evt-7").await.unwrap().is_some());
        rig.plane.shutdown().await;
    }

    #[tokio::test]
    async fn redelivery_after_dedup_window_is_still_a_duplicate() {
        let rig = rig_with_dedup(TimeDelta::hours(1)).await;
        let event = dr_event("evt-day-ahead", "f1", 60.0);

        let first = rig.plane.demand_response(event.clone()).await.unwrap();
        assert_eq!(first.achieved_kw, 60.0);

        // cache entry has expired, the event window has not
        rig.clock.set(at(11, 30));
        let again = rig.plane.demand_response(event).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(again.schedules, first.schedules);

        let committed: f64 = rig
            .plane
            .list("f1")
            .await
            .unwrap()
            .iter()
            .map(|s| s.target_reduction_kw)
            .sum();
        assert_eq!(committed, 60.0);
        rig.plane.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_facility_is_not_found() {
        let rig = rig().await;
        let mut req = request(10.0);
        req.facility_id = "nowhere".to_string();
        assert!(matches!(
            rig.plane.create(req).await,
            Err(Error::NotFound { kind: "facility", .. })
        ));
        rig.plane.shutdown().await;
    }
}
