//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Voltage protection policy engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Collaborator seams used by the policy engine.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use voltguard_monitor::PowerMonitor;

use crate::state::DeviceStatus;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{0} is unreachable")]
    Unreachable(ManagedDevice),
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },
    #[error("{0}")]
    Rejected(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Devices whose power rails the policy engine controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagedDevice {
    DeviceA,
    DeviceB,
}

impl ManagedDevice {
    pub const ALL: [ManagedDevice; 2] = [ManagedDevice::DeviceA, ManagedDevice::DeviceB];
}

impl fmt::Display for ManagedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagedDevice::DeviceA => f.write_str("device_a"),
            ManagedDevice::DeviceB => f.write_str("device_b"),
        }
    }
}

/// Board-level control of managed devices and cooling.
///
/// Every call is synchronous. Calls that talk to a device accept the longest time the
/// engine is prepared to wait and should give up after it.
pub trait DevicePlatform: Send + Sync {
    fn device_status(&self) -> Result<DeviceStatus, PlatformError>;

    fn is_reachable(&self, device: ManagedDevice, timeout: Duration) -> Result<bool, PlatformError>;

    fn request_graceful_shutdown(
        &self,
        device: ManagedDevice,
        timeout: Duration,
    ) -> Result<(), PlatformError>;

    fn set_power(&self, device: ManagedDevice, on: bool) -> Result<(), PlatformError>;

    fn set_fans(&self, on: bool) -> Result<(), PlatformError>;
}

/// Whole-process restart.
pub trait ProcessControl: Send + Sync {
    /// Restart the process. The engine stops acting once this has been called, whether
    /// or not the implementation returns.
    fn restart(&self, reason: &str);
}

/// Read-only, non-blocking access to the latest supply voltage.
pub trait VoltageSource: Send + Sync {
    fn latest_voltage(&self) -> Option<f64>;
}

impl VoltageSource for PowerMonitor {
    fn latest_voltage(&self) -> Option<f64> {
        self.cached_voltage().ok().map(|sample| sample.voltage)
    }
}
