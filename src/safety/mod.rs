//! Crop-safety constraints: envelopes per crop stage and a linear projection
//! of zone conditions under a proposed shed.

mod engine;
mod envelope;

pub use engine::{SafetyAction, SafetyEngine, SafetyVerdict};
pub use envelope::{SafetyDimension, SafetyEnvelope};
