//! TOML service configuration.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;
use thiserror::Error;

use crate::baseline::BaselineSettings;
use crate::dedup::InMemoryDedup;
use crate::dr::DrSettings;
use crate::retry::RetryPolicy;
use crate::scheduler::{
    ConflictPolicy, ControlSettings, LoopSettings, OptimizerSettings, SchedulerSettings,
};
use crate::verification::VerificationSettings;

/// Top-level service configuration parsed from TOML.
///
/// Every section is optional and falls back to its defaults. Load with
/// [`ServiceConfig::from_toml_file`], then check [`ServiceConfig::validate`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub control: ControlConfig,
    pub actuation: ActuationConfig,
    pub retry: RetryPolicy,
    pub baseline: BaselineSettings,
    pub verification: VerificationSettings,
    pub dedup: DedupConfig,
    pub optimizer: OptimizerSettings,
    pub dr: DrSettings,
}

/// HTTP listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Control-loop timing and scheduling policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    /// Seconds between control ticks (must be > 0).
    pub tick_interval_secs: u64,
    /// Bound on each sensor, store and actuator call (ms).
    pub io_timeout_ms: u64,
    /// How long API callers wait for a control loop (ms).
    pub reply_timeout_ms: u64,
    /// Queued requests per facility before callers wait.
    pub inbox_capacity: usize,
    /// How long a due schedule may be held for safety (s).
    pub activation_grace_secs: u64,
    /// Environment samples older than this are treated as missing (s).
    pub max_sample_age_secs: u64,
    /// `"exclusive"` or `"stacking"`.
    pub conflict_policy: ConflictPolicy,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            io_timeout_ms: 2_000,
            reply_timeout_ms: 10_000,
            inbox_capacity: 64,
            activation_grace_secs: 900,
            max_sample_age_secs: 600,
            conflict_policy: ConflictPolicy::Exclusive,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActuationConfig {
    /// Commands still PENDING after this long are resent (s).
    pub ack_timeout_secs: u64,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 30,
        }
    }
}

/// Demand-response event id deduplication.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupConfig {
    /// How long an event id is remembered (s).
    pub window_secs: u64,
    /// Maximum remembered ids; oldest are evicted first.
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: 86_400,
            capacity: 10_000,
        }
    }
}

/// Configuration error with field path and constraint description.
#[derive(Debug, Error)]
#[error("config error: {field}: {message}")]
pub struct ConfigError {
    /// Dotted field path (e.g., `"control.tick_interval_secs"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl ConfigError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

fn secs(value: u64) -> TimeDelta {
    TimeDelta::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

impl ServiceConfig {
    /// Parses a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::new("config", format!("cannot read \"{}\": {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::new("toml", e.to_string()))
    }

    /// Settings for every facility's control loop.
    pub fn control_settings(&self) -> ControlSettings {
        let c = &self.control;
        ControlSettings {
            scheduler: SchedulerSettings {
                activation_grace: secs(c.activation_grace_secs),
                conflict_policy: c.conflict_policy,
                ack_timeout: secs(self.actuation.ack_timeout_secs),
                max_sample_age: secs(c.max_sample_age_secs),
                retry: self.retry.clone(),
            },
            optimizer: self.optimizer.clone(),
            dr: self.dr.clone(),
            timing: LoopSettings {
                tick_interval: Duration::from_secs(c.tick_interval_secs),
                io_timeout: Duration::from_millis(c.io_timeout_ms),
                reply_timeout: Duration::from_millis(c.reply_timeout_ms),
                inbox_capacity: c.inbox_capacity,
            },
        }
    }

    /// Event-id dedup cache sized from the `[dedup]` section.
    ///
    /// # Panics
    ///
    /// Panics if `dedup.capacity` is zero; [`ServiceConfig::validate`] rejects that.
    pub fn dedup_cache(&self) -> InMemoryDedup {
        InMemoryDedup::new(secs(self.dedup.window_secs), self.dedup.capacity)
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let c = &self.control;
        if c.tick_interval_secs == 0 {
            errors.push(ConfigError::new("control.tick_interval_secs", "must be > 0"));
        }
        if c.io_timeout_ms == 0 {
            errors.push(ConfigError::new("control.io_timeout_ms", "must be > 0"));
        }
        if c.reply_timeout_ms <= c.io_timeout_ms {
            errors.push(ConfigError::new(
                "control.reply_timeout_ms",
                "must be > control.io_timeout_ms",
            ));
        }
        if c.inbox_capacity == 0 {
            errors.push(ConfigError::new("control.inbox_capacity", "must be > 0"));
        }
        if c.max_sample_age_secs == 0 {
            errors.push(ConfigError::new("control.max_sample_age_secs", "must be > 0"));
        }

        if self.actuation.ack_timeout_secs == 0 {
            errors.push(ConfigError::new("actuation.ack_timeout_secs", "must be > 0"));
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            errors.push(ConfigError::new("retry.max_attempts", "must be >= 1"));
        }
        if r.multiplier < 1.0 {
            errors.push(ConfigError::new("retry.multiplier", "must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&r.jitter) {
            errors.push(ConfigError::new("retry.jitter", "must be in [0.0, 1.0]"));
        }
        if r.initial_backoff_ms > r.max_backoff_ms {
            errors.push(ConfigError::new(
                "retry.initial_backoff_ms",
                "must be <= retry.max_backoff_ms",
            ));
        }

        let b = &self.baseline;
        if b.interval_minutes == 0 || (24 * 60) % b.interval_minutes != 0 {
            errors.push(ConfigError::new(
                "baseline.interval_minutes",
                format!("must divide a day evenly, got {}", b.interval_minutes),
            ));
        }
        if b.lookback_weeks == 0 {
            errors.push(ConfigError::new("baseline.lookback_weeks", "must be >= 1"));
        }
        if b.min_comparable_days == 0 || b.min_comparable_days > b.lookback_weeks {
            errors.push(ConfigError::new(
                "baseline.min_comparable_days",
                "must be in [1, baseline.lookback_weeks]",
            ));
        }
        if b.fallback_days == 0 {
            errors.push(ConfigError::new("baseline.fallback_days", "must be >= 1"));
        }

        let v = &self.verification;
        if !(v.fallback_energy_rate.is_finite() && v.fallback_energy_rate >= 0.0) {
            errors.push(ConfigError::new(
                "verification.fallback_energy_rate",
                "must be >= 0",
            ));
        }
        if v.default_emissions_factor < 0.0 {
            errors.push(ConfigError::new(
                "verification.default_emissions_factor",
                "must be >= 0",
            ));
        }
        for (region, factor) in &v.emissions_factors {
            if *factor < 0.0 {
                errors.push(ConfigError::new(
                    &format!("verification.emissions_factors.{region}"),
                    "must be >= 0",
                ));
            }
        }

        if self.dedup.window_secs == 0 {
            errors.push(ConfigError::new("dedup.window_secs", "must be > 0"));
        }
        if self.dedup.capacity == 0 {
            errors.push(ConfigError::new("dedup.capacity", "must be > 0"));
        }

        let o = &self.optimizer;
        if !(o.shed_fraction > 0.0 && o.shed_fraction <= 1.0) {
            errors.push(ConfigError::new(
                "optimizer.shed_fraction",
                "must be in (0.0, 1.0]",
            ));
        }
        if o.horizon_hours == 0 {
            errors.push(ConfigError::new("optimizer.horizon_hours", "must be > 0"));
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dr::AllocationKind;

    #[test]
    fn defaults_are_valid() {
        let errors = ServiceConfig::default().validate();
        assert!(errors.is_empty(), "defaults should be valid: {errors:?}");
    }

    #[test]
    fn full_toml_parses() {
        let toml = r#"
[server]
bind = "0.0.0.0"
port = 9090

[control]
tick_interval_secs = 30
io_timeout_ms = 500
reply_timeout_ms = 5000
activation_grace_secs = 600
conflict_policy = "stacking"

[actuation]
ack_timeout_secs = 20

[retry]
max_attempts = 5
initial_backoff_ms = 100

[baseline]
interval_minutes = 60
lookback_weeks = 6

[verification]
fallback_energy_rate = 0.18
emissions_factors = { wecc = 0.35, ercot = 0.42 }

[dedup]
window_secs = 3600

[optimizer]
enabled = true
shed_fraction = 0.3

[dr]
allocation = "largest_first"
action = "REDUCE_HVAC"
"#;
        let cfg = ServiceConfig::from_toml_str(toml);
        assert!(cfg.is_ok(), "valid TOML should parse: {:?}", cfg.err());
        let cfg = cfg.unwrap();
        assert_eq!(cfg.server.addr().to_string(), "0.0.0.0:9090");
        assert_eq!(cfg.control.conflict_policy, ConflictPolicy::Stacking);
        assert_eq!(cfg.dr.allocation, AllocationKind::LargestFirst);
        assert_eq!(cfg.verification.emissions_factor(Some("ercot")), 0.42);
        assert!(cfg.validate().is_empty());

        let settings = cfg.control_settings();
        assert_eq!(settings.scheduler.activation_grace, TimeDelta::minutes(10));
        assert_eq!(settings.scheduler.ack_timeout, TimeDelta::seconds(20));
        assert_eq!(settings.scheduler.retry.max_attempts, 5);
        assert_eq!(settings.timing.io_timeout, Duration::from_millis(500));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let toml = r#"
[control]
tick_interval_secs = 30
bogus_field = true
"#;
        assert!(ServiceConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn unknown_conflict_policy_is_rejected() {
        let toml = r#"
[control]
conflict_policy = "first_come"
"#;
        assert!(ServiceConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let cfg = ServiceConfig::from_toml_str("[optimizer]\nenabled = true\n").unwrap();
        assert!(cfg.optimizer.enabled);
        assert_eq!(cfg.control.tick_interval_secs, 60);
        assert_eq!(cfg.baseline.interval_minutes, 15);
    }

    #[test]
    fn validation_reports_dotted_paths() {
        let mut cfg = ServiceConfig::default();
        cfg.control.tick_interval_secs = 0;
        cfg.baseline.interval_minutes = 7;
        cfg.retry.jitter = 1.5;
        cfg.optimizer.shed_fraction = 0.0;
        cfg.verification
            .emissions_factors
            .insert("wecc".to_string(), -1.0);

        let fields: Vec<String> = cfg.validate().into_iter().map(|e| e.field).collect();
        for expected in [
            "control.tick_interval_secs",
            "baseline.interval_minutes",
            "retry.jitter",
            "optimizer.shed_fraction",
            "verification.emissions_factors.wecc",
        ] {
            assert!(fields.iter().any(|f| f == expected), "missing {expected} in {fields:?}");
        }
    }

    #[test]
    fn reply_timeout_must_exceed_io_timeout() {
        let mut cfg = ServiceConfig::default();
        cfg.control.reply_timeout_ms = cfg.control.io_timeout_ms;
        assert!(
            cfg.validate()
                .iter()
                .any(|e| e.field == "control.reply_timeout_ms")
        );
    }
}
