//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Board collaborators used by the VoltGuard daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};
use voltguard_policy::{DevicePlatform, DeviceStatus, ManagedDevice, PlatformError, ProcessControl};

/// Platform that keeps rail and fan state in memory and logs every request.
#[derive(Debug)]
pub struct LoggingPlatform {
    status: Mutex<DeviceStatus>,
    fans_on: Mutex<bool>,
}

impl LoggingPlatform {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(DeviceStatus {
                device_a_powered: true,
                device_b_powered: true,
                device_a_connected: true,
                device_b_connected: true,
                ..DeviceStatus::default()
            }),
            fans_on: Mutex::new(true),
        }
    }

    pub fn fans_on(&self) -> bool {
        *self.fans_on.lock()
    }
}

impl Default for LoggingPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl DevicePlatform for LoggingPlatform {
    fn device_status(&self) -> Result<DeviceStatus, PlatformError> {
        Ok(*self.status.lock())
    }

    fn is_reachable(&self, device: ManagedDevice, timeout: Duration) -> Result<bool, PlatformError> {
        let status = self.status.lock();
        let reachable = match device {
            ManagedDevice::DeviceA => status.device_a_powered && status.device_a_connected,
            ManagedDevice::DeviceB => status.device_b_powered && status.device_b_connected,
        };
        info!(%device, reachable, timeout_ms = timeout.as_millis() as u64, "liveness probe");
        Ok(reachable)
    }

    fn request_graceful_shutdown(
        &self,
        device: ManagedDevice,
        timeout: Duration,
    ) -> Result<(), PlatformError> {
        info!(%device, timeout_ms = timeout.as_millis() as u64, "graceful shutdown requested");
        let mut status = self.status.lock();
        match device {
            ManagedDevice::DeviceA => status.device_a_connected = false,
            ManagedDevice::DeviceB => status.device_b_connected = false,
        }
        Ok(())
    }

    fn set_power(&self, device: ManagedDevice, on: bool) -> Result<(), PlatformError> {
        warn!(%device, on, "switching device rail");
        let mut status = self.status.lock();
        match device {
            ManagedDevice::DeviceA => status.device_a_powered = on,
            ManagedDevice::DeviceB => status.device_b_powered = on,
        }
        Ok(())
    }

    fn set_fans(&self, on: bool) -> Result<(), PlatformError> {
        info!(on, "switching cooling fans");
        *self.fans_on.lock() = on;
        Ok(())
    }
}

/// Forwards restart requests to the daemon's main task, which stops both engines and
/// exits so the service manager can start a fresh process.
#[derive(Debug, Clone)]
pub struct ExitOnRestart {
    requests: mpsc::UnboundedSender<String>,
}

impl ExitOnRestart {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (Self { requests }, rx)
    }
}

impl ProcessControl for ExitOnRestart {
    fn restart(&self, reason: &str) {
        warn!(reason, "process restart requested");
        if self.requests.send(reason.to_owned()).is_err() {
            warn!("daemon main task gone, exiting immediately");
            std::process::exit(crate::RESTART_EXIT_CODE);
        }
    }
}
