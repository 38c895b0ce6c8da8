//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Sampling and telemetry protocol engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Supply voltage sampling and power-chip telemetry for VoltGuard.
//!
//! [`PowerMonitor`] owns a background worker that samples the supply rail through an
//! [`AnalogChannel`] and drains a [`SerialSource`] for 4-byte telemetry frames. Query
//! methods copy snapshots out of the shared state and never touch hardware.

pub mod engine;
pub mod errors;
pub mod events;
pub mod hal;
pub mod protocol;
pub mod sampler;
pub mod stats;

pub use engine::PowerMonitor;
pub use errors::{MonitorError, Result};
pub use events::MonitorEvent;
pub use hal::{AnalogChannel, HalError, SerialSource};
pub use protocol::{decode_frame, DecodedFrame, ProtocolError, TelemetryFrame};
pub use sampler::{VoltageSample, VoltageSampler};
pub use stats::RunningStatistics;
