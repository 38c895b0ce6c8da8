//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the power-integrity runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use thiserror::Error;
use tracing::debug;

use crate::logging::LogFormat;

/// Shortest accepted voltage sampling interval.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
/// Longest accepted voltage sampling interval.
pub const MAX_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);
/// Accepted shutdown countdown, in seconds.
pub const SHUTDOWN_DELAY_RANGE: (u32, u32) = (5, 300);
/// Accepted recovery hold, in seconds.
pub const RECOVERY_HOLD_RANGE: (u32, u32) = (1, 300);
/// Accepted fan coast-down delay, in seconds.
pub const FAN_STOP_DELAY_RANGE: (u32, u32) = (10, 600);

fn default_divider_ratio() -> f64 {
    11.4
}

fn default_adc_reference_mv() -> u32 {
    3300
}

fn default_adc_resolution_bits() -> u8 {
    12
}

fn default_sample_interval() -> Duration {
    Duration::from_millis(5000)
}

fn default_min_voltage() -> f64 {
    10.0
}

fn default_max_voltage() -> f64 {
    30.0
}

fn default_true() -> bool {
    true
}

fn default_telemetry_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_change_trace_threshold() -> f64 {
    1.0
}

fn default_low_voltage_threshold() -> f64 {
    12.6
}

fn default_recovery_voltage_threshold() -> f64 {
    18.0
}

fn default_shutdown_delay_secs() -> u32 {
    60
}

fn default_recovery_hold_secs() -> u32 {
    5
}

fn default_fan_stop_delay_secs() -> u32 {
    60
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_liveness_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_min_valid_voltage() -> f64 {
    5.0
}

fn default_state_directory() -> PathBuf {
    PathBuf::from("target/voltguard/state")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_simulation_seed() -> u64 {
    0xB10C_u64
}

fn default_nominal_voltage() -> f64 {
    24.0
}

fn default_brownout_voltage() -> f64 {
    11.0
}

fn default_noise_sigma() -> f64 {
    0.05
}

fn default_brownout_after() -> Duration {
    Duration::from_secs(30)
}

fn default_brownout_duration() -> Duration {
    Duration::from_secs(120)
}

fn default_load_current() -> f64 {
    2.5
}

/// Rejection reasons for configuration values and runtime setters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{field} must be a finite, non-negative number, got {value}")]
    NotFinite { field: &'static str, value: f64 },
    #[error("{lower} ({lower_value}) must be strictly below {upper} ({upper_value})")]
    Ordering {
        lower: &'static str,
        lower_value: f64,
        upper: &'static str,
        upper_value: f64,
    },
}

fn check_non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::NotFinite { field, value });
    }
    Ok(())
}

fn check_range(field: &'static str, value: u32, (min, max): (u32, u32)) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value: f64::from(value),
            min: f64::from(min),
            max: f64::from(max),
        });
    }
    Ok(())
}

/// Validate a voltage sampling interval.
pub fn validate_sample_interval(interval: Duration) -> Result<(), ConfigError> {
    if interval < MIN_SAMPLE_INTERVAL || interval > MAX_SAMPLE_INTERVAL {
        return Err(ConfigError::OutOfRange {
            field: "sample_interval_ms",
            value: interval.as_millis() as f64,
            min: MIN_SAMPLE_INTERVAL.as_millis() as f64,
            max: MAX_SAMPLE_INTERVAL.as_millis() as f64,
        });
    }
    Ok(())
}

/// Validate the informational alarm band of the sampling engine.
pub fn validate_alarm_thresholds(min_voltage: f64, max_voltage: f64) -> Result<(), ConfigError> {
    check_non_negative("min_voltage", min_voltage)?;
    check_non_negative("max_voltage", max_voltage)?;
    if min_voltage >= max_voltage {
        return Err(ConfigError::Ordering {
            lower: "min_voltage",
            lower_value: min_voltage,
            upper: "max_voltage",
            upper_value: max_voltage,
        });
    }
    Ok(())
}

/// Validate the hysteresis pair that drives the protection state machine.
pub fn validate_policy_thresholds(low: f64, recovery: f64) -> Result<(), ConfigError> {
    check_non_negative("low_voltage_threshold", low)?;
    check_non_negative("recovery_voltage_threshold", recovery)?;
    if low <= 0.0 {
        return Err(ConfigError::NotFinite {
            field: "low_voltage_threshold",
            value: low,
        });
    }
    if low >= recovery {
        return Err(ConfigError::Ordering {
            lower: "low_voltage_threshold",
            lower_value: low,
            upper: "recovery_voltage_threshold",
            upper_value: recovery,
        });
    }
    Ok(())
}

pub fn validate_shutdown_delay(secs: u32) -> Result<(), ConfigError> {
    check_range("shutdown_delay_secs", secs, SHUTDOWN_DELAY_RANGE)
}

pub fn validate_recovery_hold(secs: u32) -> Result<(), ConfigError> {
    check_range("recovery_hold_secs", secs, RECOVERY_HOLD_RANGE)
}

pub fn validate_fan_stop_delay(secs: u32) -> Result<(), ConfigError> {
    check_range("fan_stop_delay_secs", secs, FAN_STOP_DELAY_RANGE)
}

/// Primary configuration object for the VoltGuard runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "VOLTGUARD_CONFIG";

    /// Load configuration from disk, respecting the `VOLTGUARD_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.monitor.validate().context("invalid [monitor] section")?;
        self.policy.validate().context("invalid [policy] section")?;
        self.runtime.validate().context("invalid [runtime] section")?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// One point of a raw-count to millivolt calibration table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub raw: u16,
    pub millivolts: u32,
}

/// Sampling & protocol engine settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_divider_ratio")]
    pub divider_ratio: f64,
    #[serde(default = "default_adc_reference_mv")]
    pub adc_reference_mv: u32,
    #[serde(default = "default_adc_resolution_bits")]
    pub adc_resolution_bits: u8,
    /// Optional calibration table; linear scaling applies when empty.
    #[serde(default)]
    pub calibration: Vec<CalibrationPoint>,
    #[serde(default = "default_sample_interval", rename = "sample_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sample_interval: Duration,
    #[serde(default = "default_min_voltage")]
    pub min_voltage: f64,
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
    #[serde(default = "default_true")]
    pub threshold_alarm: bool,
    #[serde(default = "default_telemetry_timeout", rename = "telemetry_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub telemetry_timeout: Duration,
    #[serde(default = "default_poll_interval", rename = "poll_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_change_trace_threshold")]
    pub change_trace_threshold: f64,
    #[serde(default)]
    pub protocol_debug: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            divider_ratio: default_divider_ratio(),
            adc_reference_mv: default_adc_reference_mv(),
            adc_resolution_bits: default_adc_resolution_bits(),
            calibration: Vec::new(),
            sample_interval: default_sample_interval(),
            min_voltage: default_min_voltage(),
            max_voltage: default_max_voltage(),
            threshold_alarm: true,
            telemetry_timeout: default_telemetry_timeout(),
            poll_interval: default_poll_interval(),
            change_trace_threshold: default_change_trace_threshold(),
            protocol_debug: false,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.divider_ratio.is_finite() || self.divider_ratio <= 0.0 {
            return Err(ConfigError::NotFinite {
                field: "divider_ratio",
                value: self.divider_ratio,
            });
        }
        if !(1..=16).contains(&self.adc_resolution_bits) {
            return Err(ConfigError::OutOfRange {
                field: "adc_resolution_bits",
                value: f64::from(self.adc_resolution_bits),
                min: 1.0,
                max: 16.0,
            });
        }
        validate_sample_interval(self.sample_interval)?;
        validate_alarm_thresholds(self.min_voltage, self.max_voltage)?;
        if self.poll_interval.is_zero() || self.poll_interval > self.sample_interval {
            return Err(ConfigError::OutOfRange {
                field: "poll_interval_ms",
                value: self.poll_interval.as_millis() as f64,
                min: 1.0,
                max: self.sample_interval.as_millis() as f64,
            });
        }
        Ok(())
    }

    /// Largest raw count the configured ADC can report.
    pub fn adc_max_count(&self) -> u32 {
        (1u32 << self.adc_resolution_bits) - 1
    }
}

/// Protection policy settings; this is the structure persisted by the policy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_low_voltage_threshold")]
    pub low_voltage_threshold: f64,
    #[serde(default = "default_recovery_voltage_threshold")]
    pub recovery_voltage_threshold: f64,
    #[serde(default = "default_shutdown_delay_secs")]
    pub shutdown_delay_secs: u32,
    #[serde(default = "default_recovery_hold_secs")]
    pub recovery_hold_secs: u32,
    #[serde(default = "default_fan_stop_delay_secs")]
    pub fan_stop_delay_secs: u32,
    #[serde(default = "default_true")]
    pub auto_recovery_enabled: bool,
    #[serde(default = "default_true")]
    pub enable_device_shutdown: bool,
    #[serde(default)]
    pub enable_fan_control: bool,
    #[serde(default = "default_true")]
    pub liveness_check_before_shutdown: bool,
    /// Whether the daemon starts protection on boot.
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            low_voltage_threshold: default_low_voltage_threshold(),
            recovery_voltage_threshold: default_recovery_voltage_threshold(),
            shutdown_delay_secs: default_shutdown_delay_secs(),
            recovery_hold_secs: default_recovery_hold_secs(),
            fan_stop_delay_secs: default_fan_stop_delay_secs(),
            auto_recovery_enabled: true,
            enable_device_shutdown: true,
            enable_fan_control: false,
            liveness_check_before_shutdown: true,
            auto_start: true,
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_policy_thresholds(self.low_voltage_threshold, self.recovery_voltage_threshold)?;
        validate_shutdown_delay(self.shutdown_delay_secs)?;
        validate_recovery_hold(self.recovery_hold_secs)?;
        validate_fan_stop_delay(self.fan_stop_delay_secs)?;
        Ok(())
    }
}

/// Timing knobs of the policy worker that are not part of the persisted policy.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_tick_interval", rename = "tick_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    /// Upper bound for the liveness probe and for the graceful-shutdown request.
    #[serde(default = "default_liveness_timeout", rename = "liveness_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub liveness_timeout: Duration,
    /// Readings under this floor are treated as a sensor fault.
    #[serde(default = "default_min_valid_voltage")]
    pub min_valid_voltage: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            liveness_timeout: default_liveness_timeout(),
            min_valid_voltage: default_min_valid_voltage(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "tick_interval_ms",
                value: 0.0,
                min: 1.0,
                max: f64::from(u32::MAX),
            });
        }
        check_non_negative("min_valid_voltage", self.min_valid_voltage)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_state_directory")]
    pub directory: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            directory: default_state_directory(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Supply behaviour produced by the simulated hardware layer.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SupplyProfile {
    #[default]
    Steady,
    Brownout,
}

impl std::str::FromStr for SupplyProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady" => Ok(SupplyProfile::Steady),
            "brownout" => Ok(SupplyProfile::Brownout),
            other => Err(format!("unknown supply profile: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub profile: SupplyProfile,
    #[serde(default = "default_simulation_seed")]
    pub random_seed: u64,
    #[serde(default = "default_nominal_voltage")]
    pub nominal_voltage: f64,
    #[serde(default = "default_brownout_voltage")]
    pub brownout_voltage: f64,
    #[serde(default = "default_noise_sigma")]
    pub noise_sigma: f64,
    #[serde(default = "default_brownout_after", rename = "brownout_after_secs")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub brownout_after: Duration,
    #[serde(default = "default_brownout_duration", rename = "brownout_duration_secs")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub brownout_duration: Duration,
    #[serde(default = "default_load_current")]
    pub load_current: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            profile: SupplyProfile::Steady,
            random_seed: default_simulation_seed(),
            nominal_voltage: default_nominal_voltage(),
            brownout_voltage: default_brownout_voltage(),
            noise_sigma: default_noise_sigma(),
            brownout_after: default_brownout_after(),
            brownout_duration: default_brownout_duration(),
            load_current: default_load_current(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config: AppConfig = r#"
            [monitor]
            sample_interval_ms = 250
            min_voltage = 11.0
            max_voltage = 28.0

            [policy]
            shutdown_delay_secs = 30
            enable_fan_control = true

            [simulation]
            profile = "brownout"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.monitor.sample_interval, Duration::from_millis(250));
        assert_eq!(config.monitor.divider_ratio, 11.4);
        assert_eq!(config.policy.shutdown_delay_secs, 30);
        assert!(config.policy.enable_fan_control);
        assert_eq!(config.policy.low_voltage_threshold, 12.6);
        assert_eq!(config.simulation.profile, SupplyProfile::Brownout);
        assert_eq!(config.runtime.tick_interval, Duration::from_secs(1));
    }

    #[test]
    fn rejects_inverted_policy_thresholds() {
        let err = "[policy]\nlow_voltage_threshold = 20.0\nrecovery_voltage_threshold = 18.0\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{err:#}").contains("low_voltage_threshold"));
    }

    #[test]
    fn sample_interval_bounds_are_inclusive() {
        assert!(validate_sample_interval(Duration::from_millis(100)).is_ok());
        assert!(validate_sample_interval(Duration::from_secs(60)).is_ok());
        assert!(validate_sample_interval(Duration::from_millis(99)).is_err());
        assert!(validate_sample_interval(Duration::from_millis(60_001)).is_err());
    }

    #[test]
    fn alarm_thresholds_reject_negative_and_nan() {
        assert!(validate_alarm_thresholds(0.0, 1.0).is_ok());
        assert!(validate_alarm_thresholds(-1.0, 1.0).is_err());
        assert!(validate_alarm_thresholds(f64::NAN, 1.0).is_err());
        assert!(validate_alarm_thresholds(5.0, 5.0).is_err());
    }

    #[test]
    fn timer_ranges_match_setters() {
        assert!(validate_shutdown_delay(4).is_err());
        assert!(validate_shutdown_delay(5).is_ok());
        assert!(validate_shutdown_delay(301).is_err());
        assert!(validate_recovery_hold(0).is_err());
        assert!(validate_recovery_hold(300).is_ok());
        assert!(validate_fan_stop_delay(9).is_err());
        assert!(validate_fan_stop_delay(600).is_ok());
    }

    #[test]
    fn loads_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voltguard.toml");
        fs::write(&path, "[monitor]\nsample_interval_ms = 1000\n").unwrap();
        let loaded = AppConfig::load_with_source(&[path.clone()]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.monitor.sample_interval, Duration::from_secs(1));
    }
}
