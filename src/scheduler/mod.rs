//! Load-shedding lifecycle: the per-facility state machine, conflict
//! resolution, actuation tracking, the cost optimizer and the control loop
//! that drives them.

mod actuation;
mod audit;
mod conflict;
mod control_loop;
mod lifecycle;
pub mod optimizer;

pub use actuation::ActuationCommand;
pub use audit::AuditEntry;
pub use conflict::{ConflictPolicy, peak_overlap_kw};
pub use control_loop::{
    Collaborators, ControlLoop, ControlPlane, ControlSettings, FacilityHandle, LoopSettings,
};
pub use lifecycle::{AlertNotice, FacilityScheduler, SchedulerSettings, TickOutcome};
pub use optimizer::{CostOptimizer, OptimizerSettings};
