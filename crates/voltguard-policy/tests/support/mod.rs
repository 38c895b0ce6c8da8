//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Voltage protection policy engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Scripted collaborators shared by the policy integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use voltguard_common::{PolicyConfig, RuntimeConfig};
use voltguard_persistence::PersistenceError;
use voltguard_policy::{
    ConfigStore, DevicePlatform, DeviceStatus, ManagedDevice, PlatformError, PolicyCollaborators,
    PolicyEvent, PolicyEventKind, PowerPolicy, ProcessControl, VoltageSource,
};

#[derive(Default)]
pub struct ScriptedVoltage(Mutex<Option<f64>>);

impl ScriptedVoltage {
    pub fn set(&self, voltage: f64) {
        *self.0.lock() = Some(voltage);
    }

    pub fn clear(&self) {
        *self.0.lock() = None;
    }
}

impl VoltageSource for ScriptedVoltage {
    fn latest_voltage(&self) -> Option<f64> {
        *self.0.lock()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlatformCall {
    Probe(ManagedDevice),
    Graceful(ManagedDevice),
    Power(ManagedDevice, bool),
    Fans(bool),
}

pub struct RecordingPlatform {
    pub status: Mutex<DeviceStatus>,
    pub reachable: Mutex<Result<bool, String>>,
    pub fail_power: Mutex<bool>,
    /// Wall-clock time each liveness probe takes.
    pub probe_delay: Mutex<Duration>,
    pub calls: Mutex<Vec<PlatformCall>>,
}

impl Default for RecordingPlatform {
    fn default() -> Self {
        Self {
            status: Mutex::new(DeviceStatus {
                device_a_powered: true,
                device_b_powered: true,
                device_a_connected: true,
                device_b_connected: true,
                ..DeviceStatus::default()
            }),
            reachable: Mutex::new(Ok(true)),
            fail_power: Mutex::new(false),
            probe_delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingPlatform {
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().clone()
    }
}

impl DevicePlatform for RecordingPlatform {
    fn device_status(&self) -> Result<DeviceStatus, PlatformError> {
        Ok(*self.status.lock())
    }

    fn is_reachable(&self, device: ManagedDevice, _timeout: Duration) -> Result<bool, PlatformError> {
        self.calls.lock().push(PlatformCall::Probe(device));
        let delay = *self.probe_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.reachable
            .lock()
            .clone()
            .map_err(PlatformError::Rejected)
    }

    fn request_graceful_shutdown(
        &self,
        device: ManagedDevice,
        _timeout: Duration,
    ) -> Result<(), PlatformError> {
        self.calls.lock().push(PlatformCall::Graceful(device));
        Ok(())
    }

    fn set_power(&self, device: ManagedDevice, on: bool) -> Result<(), PlatformError> {
        self.calls.lock().push(PlatformCall::Power(device, on));
        if *self.fail_power.lock() {
            return Err(PlatformError::Rejected("rail controller offline".into()));
        }
        Ok(())
    }

    fn set_fans(&self, on: bool) -> Result<(), PlatformError> {
        self.calls.lock().push(PlatformCall::Fans(on));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingProcess {
    pub restarts: Mutex<Vec<String>>,
}

impl ProcessControl for RecordingProcess {
    fn restart(&self, reason: &str) {
        self.restarts.lock().push(reason.to_owned());
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub saved: Mutex<Option<PolicyConfig>>,
    pub broken: bool,
}

impl ConfigStore for MemoryStore {
    fn load_policy(&self) -> Result<Option<PolicyConfig>, PersistenceError> {
        if self.broken {
            return Err(PersistenceError::Io(std::io::Error::other("flash unavailable")));
        }
        Ok(self.saved.lock().clone())
    }

    fn save_policy(&self, config: &PolicyConfig) -> Result<(), PersistenceError> {
        if self.broken {
            return Err(PersistenceError::Io(std::io::Error::other("flash unavailable")));
        }
        *self.saved.lock() = Some(config.clone());
        Ok(())
    }
}

pub struct Harness {
    pub policy: PowerPolicy,
    pub voltage: Arc<ScriptedVoltage>,
    pub platform: Arc<RecordingPlatform>,
    pub process: Arc<RecordingProcess>,
    pub events: Arc<Mutex<Vec<PolicyEvent>>>,
}

impl Harness {
    pub fn new(config: PolicyConfig) -> Self {
        Self::with_store(config, None)
    }

    pub fn with_store(config: PolicyConfig, store: Option<Arc<dyn ConfigStore>>) -> Self {
        Self::build(config, RuntimeConfig::default(), store)
    }

    pub fn with_runtime(config: PolicyConfig, runtime: RuntimeConfig) -> Self {
        Self::build(config, runtime, None)
    }

    fn build(
        config: PolicyConfig,
        runtime: RuntimeConfig,
        store: Option<Arc<dyn ConfigStore>>,
    ) -> Self {
        let voltage = Arc::new(ScriptedVoltage::default());
        let platform = Arc::new(RecordingPlatform::default());
        let process = Arc::new(RecordingProcess::default());
        let policy = PowerPolicy::new(
            config,
            runtime,
            PolicyCollaborators {
                voltage: voltage.clone(),
                platform: platform.clone(),
                process: process.clone(),
                store,
            },
        )
        .expect("valid policy configuration");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        policy.register_callback(move |event| sink.lock().push(event.clone()));
        Self {
            policy,
            voltage,
            platform,
            process,
            events,
        }
    }

    /// Feed `voltage` for `ticks` consecutive ticks.
    pub fn feed(&self, voltage: f64, ticks: usize) {
        self.voltage.set(voltage);
        for _ in 0..ticks {
            self.policy.process_tick();
        }
    }

    pub fn kinds(&self) -> Vec<PolicyEventKind> {
        self.events.lock().iter().map(|e| e.kind.clone()).collect()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn restarts(&self) -> usize {
        self.process.restarts.lock().len()
    }
}

/// Policy with short timers matching the brownout scenario.
pub fn scenario_config() -> PolicyConfig {
    PolicyConfig {
        low_voltage_threshold: 12.6,
        recovery_voltage_threshold: 18.0,
        shutdown_delay_secs: 5,
        recovery_hold_secs: 3,
        ..PolicyConfig::default()
    }
}
