//! Domain records shared across the scheduler, DR handler and verification engine.

/// Demand-response event definitions.
pub mod event;
pub mod facility;
/// Meter readings, environment samples and non-routine events.
pub mod reading;
pub mod report;
/// Load-shedding schedules and their lifecycle vocabulary.
pub mod schedule;

pub use event::DemandResponseEvent;
pub use facility::{CropProfile, Facility, FacilityId, Zone, ZoneId, ZoneState, ZoneThermal};
pub use reading::{EnergyReading, EnvironmentSample, NonRoutineEvent};
pub use report::{BaselineMethod, SavingsReport};
pub use schedule::{
    ActionKind, CancelReason, LoadSheddingSchedule, Priority, ScheduleStatus, ShedReason,
    ShedRequest,
};
