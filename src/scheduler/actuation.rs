//! Fire-and-forget actuation with polled acknowledgement and bounded resend.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeDelta, Utc};

use crate::model::ZoneId;
use crate::ports::{AckStatus, ActuationAction, CommandId};
use crate::retry::RetryPolicy;

/// A setpoint the control loop must hand to the [`crate::ports::Actuator`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActuationCommand {
    pub zone_id: ZoneId,
    pub action: ActuationAction,
    pub duration_seconds: u64,
    /// 1 for the first send.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Resend(ActuationCommand),
    Acked { zone_id: ZoneId },
    /// Retry budget spent without an acknowledgement.
    GaveUp { zone_id: ZoneId, action: ActuationAction, attempts: u32 },
}

#[derive(Debug, Clone)]
struct Tracked {
    action: ActuationAction,
    duration_seconds: u64,
    command_id: Option<CommandId>,
    attempts: u32,
    sent_at: DateTime<Utc>,
    retry_at: Option<DateTime<Utc>>,
}

/// Latest setpoint per zone and its delivery state. A newer setpoint for a
/// zone replaces whatever was still in flight.
#[derive(Debug, Default)]
pub struct ActuationTracker {
    zones: BTreeMap<ZoneId, Tracked>,
}

impl ActuationTracker {
    /// Registers a new setpoint for `zone_id` and returns the first send.
    pub fn issue(
        &mut self,
        zone_id: &str,
        action: ActuationAction,
        duration_seconds: u64,
        now: DateTime<Utc>,
    ) -> ActuationCommand {
        self.zones.insert(
            zone_id.to_string(),
            Tracked {
                action: action.clone(),
                duration_seconds,
                command_id: None,
                attempts: 1,
                sent_at: now,
                retry_at: None,
            },
        );
        ActuationCommand {
            zone_id: zone_id.to_string(),
            action,
            duration_seconds,
            attempt: 1,
        }
    }

    /// Records the id the actuator assigned to the latest send for `zone_id`.
    pub fn on_sent(&mut self, zone_id: &str, command_id: CommandId, now: DateTime<Utc>) {
        if let Some(t) = self.zones.get_mut(zone_id) {
            t.command_id = Some(command_id);
            t.sent_at = now;
        }
    }

    /// Command ids awaiting acknowledgement.
    pub fn outstanding(&self) -> Vec<CommandId> {
        self.zones
            .values()
            .filter_map(|t| t.command_id.clone())
            .collect()
    }

    pub fn is_tracking(&self, zone_id: &str) -> bool {
        self.zones.contains_key(zone_id)
    }

    /// Advances delivery state from polled acknowledgements.
    ///
    /// A send that failed outright (no command id) or whose command is FAILED
    /// or still PENDING after `ack_timeout` is resent after the policy's
    /// backoff; once `policy.max_attempts` is spent the zone is given up.
    pub fn poll(
        &mut self,
        now: DateTime<Utc>,
        acks: &HashMap<CommandId, AckStatus>,
        policy: &RetryPolicy,
        ack_timeout: TimeDelta,
    ) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        let mut finished = Vec::new();

        for (zone_id, t) in &mut self.zones {
            let status = t
                .command_id
                .as_ref()
                .map(|id| acks.get(id).copied().unwrap_or(AckStatus::Pending));
            let failed = match status {
                Some(AckStatus::Acked) => {
                    finished.push(zone_id.clone());
                    events.push(TrackerEvent::Acked {
                        zone_id: zone_id.clone(),
                    });
                    continue;
                }
                Some(AckStatus::Failed) | None => true,
                Some(AckStatus::Pending) => now - t.sent_at >= ack_timeout,
            };
            if !failed {
                continue;
            }
            if !policy.can_retry(t.attempts) {
                finished.push(zone_id.clone());
                events.push(TrackerEvent::GaveUp {
                    zone_id: zone_id.clone(),
                    action: t.action.clone(),
                    attempts: t.attempts,
                });
                continue;
            }
            let attempts = t.attempts;
            let retry_at = *t.retry_at.get_or_insert_with(|| {
                let wait = policy.delay(attempts);
                now + TimeDelta::from_std(wait).unwrap_or(TimeDelta::zero())
            });
            if now >= retry_at {
                t.attempts += 1;
                t.retry_at = None;
                t.command_id = None;
                t.sent_at = now;
                events.push(TrackerEvent::Resend(ActuationCommand {
                    zone_id: zone_id.clone(),
                    action: t.action.clone(),
                    duration_seconds: t.duration_seconds,
                    attempt: t.attempts,
                }));
            }
        }

        for zone_id in finished {
            self.zones.remove(&zone_id);
        }
        events
    }
}
