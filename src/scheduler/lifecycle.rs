use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actuation::{ActuationCommand, ActuationTracker, TrackerEvent};
use super::audit::AuditEntry;
use super::conflict::{self, ConflictPolicy};
use crate::error::{Error, Result};
use crate::model::{
    ActionKind, CancelReason, EnvironmentSample, Facility, LoadSheddingSchedule, ScheduleStatus,
    ShedReason, ShedRequest, Zone, ZoneId, ZoneState,
};
use crate::ports::{AckStatus, ActuationAction, CommandId, Severity};
use crate::rates::RateBook;
use crate::retry::RetryPolicy;
use crate::safety::{SafetyAction, SafetyEngine, SafetyEnvelope, SafetyVerdict};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How long a due schedule may be held for safety before it times out.
    pub activation_grace: TimeDelta,
    pub conflict_policy: ConflictPolicy,
    /// Un-acknowledged commands are resent after this long.
    pub ack_timeout: TimeDelta,
    /// Samples older than this count as missing.
    pub max_sample_age: TimeDelta,
    pub retry: RetryPolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            activation_grace: TimeDelta::minutes(15),
            conflict_policy: ConflictPolicy::Exclusive,
            ack_timeout: TimeDelta::seconds(30),
            max_sample_age: TimeDelta::minutes(10),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertNotice {
    pub severity: Severity,
    pub message: String,
}

/// Side effects of one scheduler step, for the control loop to carry out.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Every schedule whose record changed, in its latest state.
    pub changed: Vec<LoadSheddingSchedule>,
    pub commands: Vec<ActuationCommand>,
    pub alerts: Vec<AlertNotice>,
    pub audit: Vec<AuditEntry>,
    /// Schedules that reached COMPLETED; their windows need a savings recompute.
    pub completed: Vec<LoadSheddingSchedule>,
}

impl TickOutcome {
    pub fn merge(&mut self, other: TickOutcome) {
        self.changed.extend(other.changed);
        self.commands.extend(other.commands);
        self.alerts.extend(other.alerts);
        self.audit.extend(other.audit);
        self.completed.extend(other.completed);
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
            && self.commands.is_empty()
            && self.alerts.is_empty()
            && self.audit.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ZoneSlot {
    zone: Zone,
    envelope: Option<SafetyEnvelope>,
    recovering_until: Option<DateTime<Utc>>,
}

/// Accumulates the effects of one step before they are turned into a [`TickOutcome`].
#[derive(Default)]
struct Pass {
    ids: BTreeSet<Uuid>,
    zones: BTreeSet<ZoneId>,
    outcome: TickOutcome,
}

impl Pass {
    fn alert(&mut self, severity: Severity, message: String) {
        self.outcome.alerts.push(AlertNotice { severity, message });
    }
}

/// Lifecycle state machine for the schedules of one facility.
///
/// Pure and synchronous: sensor samples and acknowledgement statuses are
/// passed in, and every side effect comes back as a [`TickOutcome`]. The
/// facility's control loop owns the only instance.
#[derive(Debug)]
pub struct FacilityScheduler {
    facility: Facility,
    zones: BTreeMap<ZoneId, ZoneSlot>,
    rates: RateBook,
    /// Open (PENDING/ACTIVE) schedules only.
    schedules: BTreeMap<Uuid, LoadSheddingSchedule>,
    settings: SchedulerSettings,
    safety: SafetyEngine,
    actuation: ActuationTracker,
}

impl FacilityScheduler {
    pub fn new(
        facility: Facility,
        zones: Vec<(Zone, Option<SafetyEnvelope>)>,
        rates: RateBook,
        settings: SchedulerSettings,
    ) -> Self {
        let zones = zones
            .into_iter()
            .map(|(zone, envelope)| {
                (
                    zone.id.clone(),
                    ZoneSlot {
                        zone,
                        envelope,
                        recovering_until: None,
                    },
                )
            })
            .collect();
        Self {
            facility,
            zones,
            rates,
            schedules: BTreeMap::new(),
            safety: SafetyEngine::new(settings.max_sample_age),
            settings,
            actuation: ActuationTracker::default(),
        }
    }

    /// Re-adopts open schedules from persistent storage after a restart.
    pub fn restore(&mut self, schedules: impl IntoIterator<Item = LoadSheddingSchedule>) {
        for s in schedules {
            if s.is_open() && s.facility_id == self.facility.id {
                self.schedules.insert(s.id, s);
            }
        }
    }

    pub fn facility(&self) -> &Facility {
        &self.facility
    }

    pub fn rates(&self) -> &RateBook {
        &self.rates
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values().map(|slot| &slot.zone)
    }

    pub fn zone(&self, zone_id: &str) -> Option<&Zone> {
        self.zones.get(zone_id).map(|slot| &slot.zone)
    }

    pub fn has_envelope(&self, zone_id: &str) -> bool {
        self.zones
            .get(zone_id)
            .is_some_and(|slot| slot.envelope.is_some())
    }

    /// End of the safety hold after a safety cancellation, if one is running.
    pub fn recovering_until(&self, zone_id: &str) -> Option<DateTime<Utc>> {
        self.zones.get(zone_id).and_then(|slot| slot.recovering_until)
    }

    pub fn schedule(&self, id: Uuid) -> Option<&LoadSheddingSchedule> {
        self.schedules.get(&id)
    }

    /// PENDING and ACTIVE schedules in precedence order.
    pub fn open_schedules(&self) -> Vec<&LoadSheddingSchedule> {
        let mut out: Vec<_> = self.schedules.values().collect();
        out.sort_by_key(|s| s.precedence());
        out
    }

    /// Sum of ACTIVE targets on a zone.
    pub fn active_reduction_kw(&self, zone_id: &str) -> f64 {
        self.schedules
            .values()
            .filter(|s| s.zone_id == zone_id && s.status == ScheduleStatus::Active)
            .map(|s| s.target_reduction_kw)
            .sum()
    }

    /// Reduction already reserved on a zone by grid-event schedules in `[start, end)`.
    pub fn reserved_grid_kw(
        &self,
        zone_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> f64 {
        conflict::peak_overlap_kw(
            self.schedules
                .values()
                .filter(|s| {
                    s.is_open() && s.zone_id == zone_id && s.reason == ShedReason::GridEvent
                }),
            start,
            end,
        )
    }

    pub fn outstanding_commands(&self) -> Vec<CommandId> {
        self.actuation.outstanding()
    }

    pub fn record_sent(&mut self, zone_id: &str, command_id: CommandId, now: DateTime<Utc>) {
        self.actuation.on_sent(zone_id, command_id, now);
    }

    /// Validates and admits a new PENDING schedule.
    ///
    /// # Errors
    ///
    /// * [`Error::NotFound`] for a zone outside this facility
    /// * [`Error::Configuration`] if the zone has no safety envelope, or a
    ///   `cost_optimization` request has no tariff to optimize against
    /// * [`Error::InvalidRequest`] if the window has already ended
    /// * [`Error::CapacityExceeded`] if the target cannot fit next to the
    ///   schedules it would have to coexist with
    pub fn submit(
        &mut self,
        request: ShedRequest,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(LoadSheddingSchedule, TickOutcome)> {
        if request.facility_id != self.facility.id {
            return Err(Error::not_found("facility", request.facility_id));
        }
        let slot = self
            .zones
            .get(&request.zone_id)
            .ok_or_else(|| Error::not_found("zone", request.zone_id.clone()))?;
        if slot.envelope.is_none() {
            return Err(Error::Configuration(format!(
                "zone {} has no safety envelope for {} ({})",
                slot.zone.id, slot.zone.crop_profile.crop, slot.zone.crop_profile.stage
            )));
        }
        if request.reason == ShedReason::CostOptimization {
            self.rates.rate_at(request.start_time)?;
        }
        if request.end_time <= now {
            return Err(Error::InvalidRequest(
                "schedule window has already ended".to_string(),
            ));
        }

        let capacity_kw = slot.zone.capacity_kw;
        let candidate = LoadSheddingSchedule::from_request(request, id, now);
        let policy = self.settings.conflict_policy;
        let committed = conflict::peak_overlap_kw(
            self.schedules.values().filter(|s| {
                s.is_open()
                    && s.zone_id == candidate.zone_id
                    && policy.coexist(s, &candidate)
                    && (s.reason == ShedReason::GridEvent
                        || s.precedence() < candidate.precedence())
            }),
            candidate.start_time,
            candidate.end_time,
        );
        let available_kw = (capacity_kw - committed).max(0.0);
        if candidate.target_reduction_kw > available_kw + 1e-9 {
            return Err(Error::CapacityExceeded {
                zone_id: candidate.zone_id,
                requested_kw: candidate.target_reduction_kw,
                available_kw,
            });
        }

        info!(
            facility_id = %self.facility.id,
            zone_id = %candidate.zone_id,
            schedule_id = %candidate.id,
            reason = %candidate.reason,
            priority = candidate.priority.rank(),
            target_kw = candidate.target_reduction_kw,
            "schedule created"
        );
        let mut outcome = TickOutcome::default();
        outcome
            .audit
            .push(AuditEntry::transition(now, &candidate, None, "created"));
        outcome.changed.push(candidate.clone());
        self.schedules.insert(candidate.id, candidate.clone());
        Ok((candidate, outcome))
    }

    /// Drops a just-created PENDING schedule whose record could not be
    /// persisted. Schedules that already changed state are kept.
    pub fn forget(&mut self, id: Uuid) {
        if self
            .schedules
            .get(&id)
            .is_some_and(|s| s.status == ScheduleStatus::Pending && s.held_since.is_none())
        {
            self.schedules.remove(&id);
        }
    }

    /// Cancels a PENDING or ACTIVE schedule on user request.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the schedule is not open in this facility, and
    /// [`Error::ScheduleClosed`] once its window has ended.
    pub fn cancel(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(LoadSheddingSchedule, TickOutcome)> {
        let schedule = self
            .schedules
            .get(&id)
            .ok_or_else(|| Error::not_found("schedule", id.to_string()))?;
        if now >= schedule.end_time {
            return Err(Error::ScheduleClosed {
                id,
                status: format!("{}, window ended", schedule.status),
            });
        }

        let mut pass = Pass::default();
        self.set_status(
            id,
            ScheduleStatus::Cancelled,
            Some(CancelReason::User),
            now,
            "cancelled by user".to_string(),
            &mut pass,
        );
        let cancelled = self.schedules.get(&id).cloned();
        let outcome = self.finish(pass, now);
        cancelled
            .map(|s| (s, outcome))
            .ok_or_else(|| Error::not_found("schedule", id.to_string()))
    }

    /// Advances every open schedule to `now`.
    ///
    /// Order within a step: actuation delivery, completions, expiries,
    /// safety re-checks of ACTIVE schedules, then activation of due PENDING
    /// schedules through per-zone conflict resolution.
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        samples: &HashMap<ZoneId, EnvironmentSample>,
        acks: &HashMap<CommandId, AckStatus>,
    ) -> TickOutcome {
        let mut pass = Pass::default();

        self.track_actuation(now, acks, &mut pass);

        // completions
        for id in self.ids_where(|s| s.status == ScheduleStatus::Active && now >= s.end_time) {
            self.set_status(
                id,
                ScheduleStatus::Completed,
                None,
                now,
                "window ended".to_string(),
                &mut pass,
            );
            if let Some(s) = self.schedules.get(&id) {
                pass.outcome.completed.push(s.clone());
            }
        }

        // PENDING schedules whose window passed
        for id in self.ids_where(|s| s.status == ScheduleStatus::Pending && now >= s.end_time) {
            let held = self.schedules.get(&id).is_some_and(|s| s.held_since.is_some());
            let (reason, detail) = if held {
                (CancelReason::SafetyTimeout, "held for safety until the window ended")
            } else {
                (CancelReason::Expired, "window passed without activation")
            };
            self.set_status(
                id,
                ScheduleStatus::Cancelled,
                Some(reason),
                now,
                detail.to_string(),
                &mut pass,
            );
        }

        self.recheck_active(now, samples, &mut pass);
        let safe_pending = self.screen_due_pending(now, samples, &mut pass);
        self.resolve_conflicts(now, safe_pending, &mut pass);

        self.finish(pass, now)
    }

    fn ids_where(&self, pred: impl Fn(&LoadSheddingSchedule) -> bool) -> Vec<Uuid> {
        let mut matching: Vec<&LoadSheddingSchedule> =
            self.schedules.values().filter(|s| pred(s)).collect();
        matching.sort_by_key(|s| s.precedence());
        matching.into_iter().map(|s| s.id).collect()
    }

    fn track_actuation(
        &mut self,
        now: DateTime<Utc>,
        acks: &HashMap<CommandId, AckStatus>,
        pass: &mut Pass,
    ) {
        let events = self.actuation.poll(
            now,
            acks,
            &self.settings.retry,
            self.settings.ack_timeout,
        );
        for event in events {
            match event {
                TrackerEvent::Resend(cmd) => {
                    warn!(
                        zone_id = %cmd.zone_id,
                        attempt = cmd.attempt,
                        "resending unacknowledged command"
                    );
                    pass.outcome.commands.push(cmd);
                }
                TrackerEvent::Acked { zone_id } => {
                    debug!(%zone_id, "actuation acknowledged");
                }
                TrackerEvent::GaveUp {
                    zone_id,
                    action,
                    attempts,
                } => {
                    error!(%zone_id, attempts, "actuation failed: {action}");
                    pass.alert(
                        Severity::Critical,
                        format!(
                            "ActuationFailed: zone {zone_id} did not acknowledge \"{action}\" after {attempts} attempts"
                        ),
                    );
                    for s in self.schedules.values_mut().filter(|s| {
                        s.zone_id == zone_id && s.status == ScheduleStatus::Active && !s.degraded
                    }) {
                        s.degraded = true;
                        pass.outcome.audit.push(AuditEntry::transition(
                            now,
                            s,
                            Some(s.status),
                            format!("actuation unacknowledged after {attempts} attempts"),
                        ));
                        pass.ids.insert(s.id);
                    }
                }
            }
        }
    }

    fn verdict(
        &self,
        schedule: &LoadSheddingSchedule,
        samples: &HashMap<ZoneId, EnvironmentSample>,
        now: DateTime<Utc>,
    ) -> SafetyVerdict {
        let Some(slot) = self.zones.get(&schedule.zone_id) else {
            return SafetyVerdict {
                safe: false,
                reason: Some(format!("zone {} is no longer configured", schedule.zone_id)),
                dimension: None,
                max_safe_duration_minutes: Some(0.0),
                recovery_minutes: 0.0,
            };
        };
        let Some(envelope) = slot.envelope.as_ref() else {
            return SafetyVerdict {
                safe: false,
                reason: Some(format!("zone {} has no safety envelope", schedule.zone_id)),
                dimension: None,
                max_safe_duration_minutes: Some(0.0),
                recovery_minutes: 0.0,
            };
        };
        let action = SafetyAction {
            kind: schedule.action,
            magnitude_kw: schedule.target_reduction_kw,
            start: now.max(schedule.start_time),
            end: schedule.end_time,
        };
        self.safety
            .is_action_safe(&slot.zone, envelope, samples.get(&schedule.zone_id), &action, now)
    }

    fn recheck_active(
        &mut self,
        now: DateTime<Utc>,
        samples: &HashMap<ZoneId, EnvironmentSample>,
        pass: &mut Pass,
    ) {
        for id in self.ids_where(|s| s.status == ScheduleStatus::Active) {
            let Some(schedule) = self.schedules.get(&id) else {
                continue;
            };
            let verdict = self.verdict(schedule, samples, now);
            if verdict.safe {
                continue;
            }
            let zone_id = schedule.zone_id.clone();
            let reason = verdict.reason.unwrap_or_default();
            let dimension = verdict
                .dimension
                .map_or_else(|| "configuration".to_string(), |d| d.to_string());
            let recovery = verdict.recovery_minutes;

            error!(
                %zone_id,
                schedule_id = %id,
                %dimension,
                recovery_minutes = recovery,
                "safety violation: {reason}"
            );
            if let Some(slot) = self.zones.get_mut(&zone_id) {
                let until = now + TimeDelta::seconds((recovery * 60.0).ceil() as i64);
                slot.recovering_until = Some(slot.recovering_until.map_or(until, |u| u.max(until)));
            }
            self.set_status(
                id,
                ScheduleStatus::Cancelled,
                Some(CancelReason::SafetyViolation),
                now,
                format!("{dimension}: {reason}"),
                pass,
            );
            pass.alert(
                Severity::Critical,
                format!(
                    "SafetyViolation: schedule {id} on zone {zone_id} cancelled ({dimension}); \
                     zone needs about {recovery:.0} min to recover. {reason}"
                ),
            );
        }
    }

    /// Holds or times out due PENDING schedules that cannot start safely;
    /// returns the ones that can.
    fn screen_due_pending(
        &mut self,
        now: DateTime<Utc>,
        samples: &HashMap<ZoneId, EnvironmentSample>,
        pass: &mut Pass,
    ) -> Vec<Uuid> {
        let mut safe = Vec::new();
        for id in self.ids_where(|s| s.status == ScheduleStatus::Pending && s.is_due(now)) {
            let Some(schedule) = self.schedules.get(&id) else {
                continue;
            };
            let recovering = self
                .recovering_until(&schedule.zone_id)
                .is_some_and(|until| now < until);
            let hold_reason = if recovering {
                Some("zone is recovering from a safety cancellation".to_string())
            } else {
                let verdict = self.verdict(schedule, samples, now);
                if verdict.safe {
                    None
                } else {
                    Some(verdict.reason.unwrap_or_else(|| "unsafe".to_string()))
                }
            };
            let Some(hold_reason) = hold_reason else {
                safe.push(id);
                continue;
            };

            let deadline = schedule.start_time + self.settings.activation_grace;
            if now >= deadline {
                let zone_id = schedule.zone_id.clone();
                warn!(%zone_id, schedule_id = %id, "activation grace expired: {hold_reason}");
                self.set_status(
                    id,
                    ScheduleStatus::Cancelled,
                    Some(CancelReason::SafetyTimeout),
                    now,
                    format!("not safe to start within the grace period: {hold_reason}"),
                    pass,
                );
                pass.alert(
                    Severity::Warning,
                    format!(
                        "Schedule {id} on zone {zone_id} timed out waiting for safe conditions: {hold_reason}"
                    ),
                );
            } else if let Some(s) = self.schedules.get_mut(&id) {
                if s.held_since.is_none() {
                    warn!(
                        zone_id = %s.zone_id,
                        schedule_id = %id,
                        "holding activation: {hold_reason}"
                    );
                    s.held_since = Some(now);
                    pass.ids.insert(id);
                }
            }
        }
        safe
    }

    fn resolve_conflicts(&mut self, now: DateTime<Utc>, safe_pending: Vec<Uuid>, pass: &mut Pass) {
        let zone_ids: Vec<ZoneId> = self.zones.keys().cloned().collect();
        for zone_id in zone_ids {
            let Some(capacity_kw) = self.zone(&zone_id).map(|z| z.capacity_kw) else {
                continue;
            };
            let candidates: Vec<&LoadSheddingSchedule> = self
                .schedules
                .values()
                .filter(|s| s.zone_id == zone_id)
                .filter(|s| s.status == ScheduleStatus::Active || safe_pending.contains(&s.id))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let resolution =
                conflict::resolve(&candidates, capacity_kw, self.settings.conflict_policy);

            for id in resolution.admitted {
                let pending = self
                    .schedules
                    .get(&id)
                    .is_some_and(|s| s.status == ScheduleStatus::Pending);
                if pending {
                    self.set_status(
                        id,
                        ScheduleStatus::Active,
                        None,
                        now,
                        "activated".to_string(),
                        pass,
                    );
                }
            }
            for id in resolution.superseded {
                self.set_status(
                    id,
                    ScheduleStatus::Cancelled,
                    Some(CancelReason::Superseded),
                    now,
                    "superseded by a higher-precedence schedule".to_string(),
                    pass,
                );
            }
        }
    }

    fn set_status(
        &mut self,
        id: Uuid,
        to: ScheduleStatus,
        cancel_reason: Option<CancelReason>,
        now: DateTime<Utc>,
        detail: String,
        pass: &mut Pass,
    ) {
        let Some(s) = self.schedules.get_mut(&id) else {
            return;
        };
        let from = s.status;
        s.status = to;
        match to {
            ScheduleStatus::Active => s.activated_at = Some(now),
            ScheduleStatus::Completed | ScheduleStatus::Cancelled => {
                s.finished_at = Some(now);
                s.cancel_reason = cancel_reason;
            }
            ScheduleStatus::Pending => {}
        }
        info!(
            zone_id = %s.zone_id,
            schedule_id = %id,
            %from,
            %to,
            cancel_reason = ?cancel_reason,
            "{detail}"
        );
        pass.outcome
            .audit
            .push(AuditEntry::transition(now, s, Some(from), detail));
        pass.ids.insert(id);
        if from == ScheduleStatus::Active || to == ScheduleStatus::Active {
            pass.zones.insert(s.zone_id.clone());
        }
    }

    /// New setpoint for every touched zone, then drop closed schedules.
    fn finish(&mut self, mut pass: Pass, now: DateTime<Utc>) -> TickOutcome {
        for zone_id in &pass.zones {
            let mut active: Vec<&LoadSheddingSchedule> = self
                .schedules
                .values()
                .filter(|s| &s.zone_id == zone_id && s.status == ScheduleStatus::Active)
                .collect();
            active.sort_by_key(|s| s.precedence());

            let (action, state, duration_seconds) = match active.first() {
                None => (ActuationAction::Restore, ZoneState::Normal, 0),
                Some(lead) => {
                    let total: f64 = active.iter().map(|s| s.target_reduction_kw).sum();
                    let until = active.iter().map(|s| s.end_time).max().unwrap_or(now);
                    let state = if lead.action == ActionKind::Shift {
                        ZoneState::Shifted
                    } else {
                        ZoneState::Shed
                    };
                    (
                        ActuationAction::Shed {
                            kind: lead.action,
                            reduction_kw: total,
                        },
                        state,
                        (until - now).num_seconds().max(0) as u64,
                    )
                }
            };
            if let Some(slot) = self.zones.get_mut(zone_id) {
                slot.zone.state = state;
            }
            debug!(%zone_id, "new setpoint: {action}");
            pass.outcome
                .commands
                .push(self.actuation.issue(zone_id, action, duration_seconds, now));
        }

        pass.outcome.changed = pass
            .ids
            .iter()
            .filter_map(|id| self.schedules.get(id).cloned())
            .collect();
        self.schedules.retain(|_, s| s.is_open());
        pass.outcome
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono_tz::Tz;

    use super::*;
    use crate::model::{CropProfile, Priority, ZoneThermal};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, h, m, 0).unwrap()
    }

    fn envelope() -> SafetyEnvelope {
        SafetyEnvelope {
            min_temp_c: 15.0,
            max_temp_c: 30.0,
            min_humidity_pct: 40.0,
            max_humidity_pct: 90.0,
            min_dli: 10.0,
            max_continuous_dark_hours: 12.0,
        }
    }

    fn zone(id: &str, capacity_kw: f64) -> Zone {
        Zone {
            id: id.to_string(),
            facility_id: "f1".to_string(),
            capacity_kw,
            lighting_kw: capacity_kw,
            crop_profile: CropProfile::new("lettuce", "vegetative"),
            thermal: ZoneThermal::default(),
            state: ZoneState::Normal,
        }
    }

    fn scheduler(policy: ConflictPolicy) -> FacilityScheduler {
        let facility = Facility {
            id: "f1".to_string(),
            timezone: "UTC".to_string(),
            rate_zone: "rz".to_string(),
            emissions_region: None,
        };
        FacilityScheduler::new(
            facility,
            vec![
                (zone("z1", 100.0), Some(envelope())),
                (zone("bare", 50.0), None),
            ],
            RateBook::new("rz", Tz::UTC, Vec::new()),
            SchedulerSettings {
                conflict_policy: policy,
                ..SchedulerSettings::default()
            },
        )
    }

    fn sample(zone_id: &str, observed_at: DateTime<Utc>) -> EnvironmentSample {
        EnvironmentSample {
            zone_id: zone_id.to_string(),
            observed_at,
            temp_c: 22.0,
            humidity_pct: 60.0,
            dli_today: 12.0,
            planned_dli_remaining: 8.0,
            dark_hours: 0.0,
            lights_on: true,
        }
    }

    fn samples(now: DateTime<Utc>) -> HashMap<ZoneId, EnvironmentSample> {
        HashMap::from([("z1".to_string(), sample("z1", now))])
    }

    fn request(
        priority: Priority,
        kw: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ShedRequest {
        ShedRequest::new(
            "f1",
            "z1",
            start,
            end,
            kw,
            priority,
            ShedReason::PeakDemand,
            ActionKind::Shift,
        )
        .unwrap()
    }

    #[test]
    fn rejects_target_above_capacity() {
        let mut s = scheduler(ConflictPolicy::Exclusive);
        let err = s
            .submit(
                request(Priority::Medium, 120.0, at(14, 0), at(16, 0)),
                Uuid::new_v4(),
                at(9, 0),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded { available_kw, .. } if available_kw == 100.0
        ));
    }

    #[test]
    fn zone_without_envelope_is_configuration_error() {
        let mut s = scheduler(ConflictPolicy::Exclusive);
        let req = ShedRequest::new(
            "f1",
            "bare",
            at(14, 0),
            at(16, 0),
            10.0,
            Priority::Medium,
            ShedReason::Manual,
            ActionKind::ReduceLight,
        )
        .unwrap();
        assert!(matches!(
            s.submit(req, Uuid::new_v4(), at(9, 0)),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn cost_optimization_needs_a_tariff() {
        let mut s = scheduler(ConflictPolicy::Exclusive);
        let req = ShedRequest::new(
            "f1",
            "z1",
            at(14, 0),
            at(16, 0),
            10.0,
            Priority::Low,
            ShedReason::CostOptimization,
            ActionKind::Shift,
        )
        .unwrap();
        assert!(matches!(
            s.submit(req, Uuid::new_v4(), at(9, 0)),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn stacking_counts_preceding_overlaps() {
        let mut s = scheduler(ConflictPolicy::Stacking);
        s.submit(request(Priority::High, 70.0, at(14, 0), at(16, 0)), Uuid::new_v4(), at(9, 0))
            .unwrap();
        let err = s
            .submit(request(Priority::Medium, 40.0, at(15, 0), at(17, 0)), Uuid::new_v4(), at(9, 1))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded { available_kw, .. } if (available_kw - 30.0).abs() < 1e-9
        ));
        // outside the overlap it fits
        s.submit(request(Priority::Medium, 40.0, at(16, 0), at(17, 0)), Uuid::new_v4(), at(9, 2))
            .unwrap();
    }

    #[test]
    fn activates_then_completes_with_setpoints() {
        let mut s = scheduler(ConflictPolicy::Exclusive);
        let (created, _) = s
            .submit(request(Priority::Medium, 30.0, at(14, 0), at(16, 0)), Uuid::new_v4(), at(9, 0))
            .unwrap();

        let out = s.tick(at(14, 0), &samples(at(14, 0)), &HashMap::new());
        assert_eq!(s.schedule(created.id).unwrap().status, ScheduleStatus::Active);
        assert_eq!(s.zone("z1").unwrap().state, ZoneState::Shifted);
        assert_eq!(out.commands.len(), 1);
        assert!(matches!(
            out.commands[0].action,
            ActuationAction::Shed { reduction_kw, .. } if reduction_kw == 30.0
        ));

        let out = s.tick(at(16, 0), &samples(at(16, 0)), &HashMap::new());
        assert!(s.schedule(created.id).is_none());
        assert_eq!(out.completed.len(), 1);
        assert_eq!(out.changed[0].status, ScheduleStatus::Completed);
        assert_eq!(out.commands.last().unwrap().action, ActuationAction::Restore);
        assert_eq!(s.zone("z1").unwrap().state, ZoneState::Normal);
    }

    #[test]
    fn user_cancel_only_while_open() {
        let mut s = scheduler(ConflictPolicy::Exclusive);
        let (created, _) = s
            .submit(request(Priority::Medium, 30.0, at(14, 0), at(16, 0)), Uuid::new_v4(), at(9, 0))
            .unwrap();
        let (cancelled, outcome) = s.cancel(created.id, at(10, 0)).unwrap();
        assert_eq!(cancelled.status, ScheduleStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason, Some(CancelReason::User));
        assert_eq!(outcome.audit.len(), 1);
        assert!(matches!(s.cancel(created.id, at(10, 0)), Err(Error::NotFound { .. })));
    }

    #[test]
    fn unseen_pending_expires() {
        let mut s = scheduler(ConflictPolicy::Exclusive);
        let (created, _) = s
            .submit(request(Priority::Medium, 30.0, at(14, 0), at(15, 0)), Uuid::new_v4(), at(9, 0))
            .unwrap();
        let out = s.tick(at(15, 30), &samples(at(15, 30)), &HashMap::new());
        assert_eq!(out.changed[0].id, created.id);
        assert_eq!(out.changed[0].cancel_reason, Some(CancelReason::Expired));
    }

    #[test]
    fn stale_sample_cancels_active_and_starts_recovery() {
        let mut s = scheduler(ConflictPolicy::Exclusive);
        s.submit(request(Priority::Medium, 30.0, at(14, 0), at(16, 0)), Uuid::new_v4(), at(9, 0))
            .unwrap();
        s.tick(at(14, 0), &samples(at(14, 0)), &HashMap::new());

        let stale = samples(at(14, 0));
        let out = s.tick(at(14, 30), &stale, &HashMap::new());
        assert_eq!(out.changed[0].cancel_reason, Some(CancelReason::SafetyViolation));
        assert_eq!(out.alerts[0].severity, Severity::Critical);
        assert!(out.alerts[0].message.contains("sensor data"));
        assert_eq!(out.commands.last().unwrap().action, ActuationAction::Restore);
    }

    #[test]
    fn recovery_blocks_new_activations() {
        let mut s = scheduler(ConflictPolicy::Exclusive);
        let mut hot = sample("z1", at(14, 0));
        hot.temp_c = 33.0;
        s.submit(request(Priority::Medium, 30.0, at(13, 0), at(16, 0)), Uuid::new_v4(), at(9, 0))
            .unwrap();
        s.tick(at(13, 0), &samples(at(13, 0)), &HashMap::new());
        // 3 °C over at 2 °C/h recovery -> 90 min hold
        s.tick(at(14, 0), &HashMap::from([("z1".to_string(), hot)]), &HashMap::new());
        assert_eq!(s.recovering_until("z1"), Some(at(15, 30)));

        let (next, _) = s
            .submit(
                request(Priority::Medium, 10.0, at(14, 5), at(16, 0)),
                Uuid::new_v4(),
                at(14, 1),
            )
            .unwrap();
        s.tick(at(14, 5), &samples(at(14, 5)), &HashMap::new());
        let held = s.schedule(next.id).unwrap();
        assert_eq!(held.status, ScheduleStatus::Pending);
        assert_eq!(held.held_since, Some(at(14, 5)));
    }

    #[test]
    fn unacknowledged_setpoint_degrades_schedule() {
        let mut s = scheduler(ConflictPolicy::Exclusive);
        s.settings.retry = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let (created, _) = s
            .submit(request(Priority::Medium, 30.0, at(14, 0), at(16, 0)), Uuid::new_v4(), at(9, 0))
            .unwrap();
        s.tick(at(14, 0), &samples(at(14, 0)), &HashMap::new());
        s.record_sent("z1", "cmd-1".to_string(), at(14, 0));

        let acks = HashMap::from([("cmd-1".to_string(), AckStatus::Failed)]);
        let out = s.tick(at(14, 1), &samples(at(14, 1)), &acks);
        assert!(out.alerts[0].message.starts_with("ActuationFailed"));
        let degraded = s.schedule(created.id).unwrap();
        assert!(degraded.degraded);
        assert_eq!(degraded.status, ScheduleStatus::Active);
    }
}
