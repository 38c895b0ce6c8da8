//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the power-integrity runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the VoltGuard workspace.
//! This crate exposes configuration loading, tracing setup, monotonic time
//! helpers, running statistics and the event hub consumed by both engines.

pub mod config;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod time;

pub use config::{
    AppConfig, CalibrationPoint, ConfigError, LoadedAppConfig, LoggingConfig, MonitorConfig,
    PersistenceConfig, PolicyConfig, RuntimeConfig, SimulationConfig, SupplyProfile,
};
pub use events::{EventCallback, EventHub};
pub use logging::{init_tracing, LogFormat};
pub use metrics::{JitterSummary, LoopTimingReporter, RunningMean};
pub use time::MonotonicClock;
