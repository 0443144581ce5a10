//! Energy optimization, demand-response control and savings verification
//! for horticulture facilities.
//!
//! Leaf-first: [`rates`], [`baseline`] and [`safety`] are pure; the
//! [`scheduler`] and [`dr`] handler run inside one control loop per
//! facility; [`verification`] and [`recommend`] turn meter history into
//! savings reports and advice.

#[cfg(feature = "api")]
pub mod api;
pub mod baseline;
pub mod cli;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod dr;
pub mod error;
pub mod inventory;
pub mod io;
pub mod model;
pub mod ports;
pub mod rates;
pub mod recommend;
pub mod reporting;
pub mod retry;
pub mod safety;
pub mod scheduler;
pub mod synthetic;
pub mod telemetry;
pub mod verification;

pub use error::{Error, Result};
