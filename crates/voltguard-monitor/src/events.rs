//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Sampling and telemetry protocol engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::Serialize;

use crate::protocol::TelemetryFrame;
use crate::sampler::VoltageSample;

/// Notifications emitted by the sampling worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A sample fell outside the informational alarm band.
    ThresholdBreach {
        sample: VoltageSample,
        min_voltage: f64,
        max_voltage: f64,
    },
    TelemetryReceived { frame: TelemetryFrame },
    ChecksumError { frame: TelemetryFrame },
    /// No complete frame arrived within the configured window.
    TelemetryTimeout { silent_ms: u64 },
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::ThresholdBreach { .. } => "threshold_breach",
            MonitorEvent::TelemetryReceived { .. } => "telemetry_received",
            MonitorEvent::ChecksumError { .. } => "checksum_error",
            MonitorEvent::TelemetryTimeout { .. } => "telemetry_timeout",
        }
    }
}
