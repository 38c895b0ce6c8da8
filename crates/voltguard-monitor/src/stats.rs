//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Sampling and telemetry protocol engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Instant;

use serde::Serialize;
use voltguard_common::time::duration_to_millis;
use voltguard_common::RunningMean;

use crate::protocol::TelemetryFrame;

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunningStatistics {
    pub sample_count: u64,
    pub frame_count: u64,
    pub checksum_error_count: u64,
    pub timeout_error_count: u64,
    pub threshold_violation_count: u64,
    pub hardware_error_count: u64,
    pub uptime_ms: u64,
    pub average_voltage: f64,
    pub average_current: f64,
    pub average_power: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct StatsAccumulator {
    started_at: Instant,
    frame_count: u64,
    checksum_error_count: u64,
    timeout_error_count: u64,
    threshold_violation_count: u64,
    hardware_error_count: u64,
    voltage: RunningMean,
    current: RunningMean,
    power: RunningMean,
}

impl StatsAccumulator {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            frame_count: 0,
            checksum_error_count: 0,
            timeout_error_count: 0,
            threshold_violation_count: 0,
            hardware_error_count: 0,
            voltage: RunningMean::new(),
            current: RunningMean::new(),
            power: RunningMean::new(),
        }
    }

    pub(crate) fn record_sample(&mut self, voltage: f64) {
        self.voltage.push(voltage);
    }

    /// Count a frame; only trusted frames feed the telemetry averages.
    pub(crate) fn record_frame(&mut self, frame: &TelemetryFrame) {
        self.frame_count += 1;
        if frame.checksum_valid {
            self.current.push(frame.current);
            self.power.push(frame.power);
        } else {
            self.checksum_error_count += 1;
        }
    }

    pub(crate) fn record_timeout(&mut self) {
        self.timeout_error_count += 1;
    }

    pub(crate) fn record_violation(&mut self) {
        self.threshold_violation_count += 1;
    }

    /// Returns the running failure count.
    pub(crate) fn record_hardware_error(&mut self) -> u64 {
        self.hardware_error_count += 1;
        self.hardware_error_count
    }

    pub(crate) fn snapshot(&self, now: Instant) -> RunningStatistics {
        RunningStatistics {
            sample_count: self.voltage.count(),
            frame_count: self.frame_count,
            checksum_error_count: self.checksum_error_count,
            timeout_error_count: self.timeout_error_count,
            threshold_violation_count: self.threshold_violation_count,
            hardware_error_count: self.hardware_error_count,
            uptime_ms: duration_to_millis(now.saturating_duration_since(self.started_at)),
            average_voltage: self.voltage.mean(),
            average_current: self.current.mean(),
            average_power: self.power.mean(),
        }
    }
}
