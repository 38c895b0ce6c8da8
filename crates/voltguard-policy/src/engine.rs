//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Voltage protection policy engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use voltguard_common::config::{
    validate_fan_stop_delay, validate_policy_thresholds, validate_recovery_hold,
    validate_shutdown_delay,
};
use voltguard_common::{EventHub, LoopTimingReporter, MonotonicClock, PolicyConfig, RuntimeConfig};
use voltguard_rt::{spawn_periodic, WorkerHandle};

use crate::errors::{PolicyError, Result};
use crate::events::{PolicyEvent, PolicyEventKind};
use crate::platform::{DevicePlatform, ManagedDevice, ProcessControl, VoltageSource};
use crate::state::{DeviceStatus, PolicyStatus, ProtectionState};
use crate::store::ConfigStore;

const WORKER_NAME: &str = "power-policy";
/// Offset below the low threshold used by rehearsal mode.
const TEST_VOLTAGE_OFFSET: f64 = 0.5;

/// External services the policy engine drives.
#[derive(Clone)]
pub struct PolicyCollaborators {
    pub voltage: Arc<dyn VoltageSource>,
    pub platform: Arc<dyn DevicePlatform>,
    pub process: Arc<dyn ProcessControl>,
    pub store: Option<Arc<dyn ConfigStore>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DebugMode {
    Off,
    On { expires_at: Option<Instant> },
}

/// Side effect decided under the lock and carried out after it is released.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    Shutdown,
    StopFans,
    Restart,
}

#[derive(Debug)]
struct PolicyState {
    config: PolicyConfig,
    state: ProtectionState,
    current_voltage: f64,
    last_good_voltage: Option<f64>,
    countdown_remaining: u32,
    recovery_remaining: u32,
    fan_stop_remaining: u32,
    fans_stopped: bool,
    protection_count: u32,
    device_status: DeviceStatus,
    test_voltage: Option<f64>,
    debug: DebugMode,
    invalid_streak: u64,
    restart_requested: bool,
}

impl PolicyState {
    fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            state: ProtectionState::Normal,
            current_voltage: 0.0,
            last_good_voltage: None,
            countdown_remaining: 0,
            recovery_remaining: 0,
            fan_stop_remaining: 0,
            fans_stopped: false,
            protection_count: 0,
            device_status: DeviceStatus::default(),
            test_voltage: None,
            debug: DebugMode::Off,
            invalid_streak: 0,
            restart_requested: false,
        }
    }

    fn enter(&mut self, to: ProtectionState, kinds: &mut Vec<PolicyEventKind>) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(from = %from, to = %to, voltage = self.current_voltage, "protection state changed");
        kinds.push(PolicyEventKind::StateChanged { from, to });
    }

    /// Apply the hysteresis rules for one plausible reading.
    fn evaluate(&mut self, voltage: f64, kinds: &mut Vec<PolicyEventKind>) {
        let low = self.config.low_voltage_threshold;
        let recovery = self.config.recovery_voltage_threshold;
        match self.state {
            ProtectionState::Normal if voltage < low => {
                warn!(voltage, threshold = low, "supply below low-voltage threshold");
                self.countdown_remaining = self.config.shutdown_delay_secs;
                self.enter(ProtectionState::LowVoltage, kinds);
                kinds.push(PolicyEventKind::LowVoltage { voltage });
            }
            ProtectionState::LowVoltage if voltage >= low => {
                info!(voltage, remaining = self.countdown_remaining, "shutdown countdown cancelled");
                self.countdown_remaining = 0;
                self.enter(ProtectionState::Normal, kinds);
            }
            ProtectionState::Protected
                if voltage >= recovery && self.config.auto_recovery_enabled =>
            {
                self.recovery_remaining = self.config.recovery_hold_secs;
                self.enter(ProtectionState::Recovery, kinds);
                kinds.push(PolicyEventKind::RecoveryStart { voltage });
            }
            ProtectionState::Recovery if voltage < recovery => {
                warn!(voltage, remaining = self.recovery_remaining, "false recovery, hold cancelled");
                self.recovery_remaining = 0;
                self.enter(ProtectionState::Protected, kinds);
            }
            _ => {}
        }
    }

    /// Advance the per-tick countdowns.
    fn advance_timers(&mut self, kinds: &mut Vec<PolicyEventKind>) -> Option<Action> {
        match self.state {
            ProtectionState::LowVoltage if self.countdown_remaining > 0 => {
                self.countdown_remaining -= 1;
                let remaining = self.countdown_remaining;
                if remaining % 10 == 0 || remaining <= 5 {
                    warn!(remaining, "low voltage countdown");
                }
                kinds.push(PolicyEventKind::CountdownTick {
                    remaining_secs: remaining,
                });
                if remaining == 0 {
                    self.enter(ProtectionState::Shutdown, kinds);
                    kinds.push(PolicyEventKind::ShutdownStart);
                    return Some(Action::Shutdown);
                }
                None
            }
            ProtectionState::Recovery if self.recovery_remaining > 0 => {
                self.recovery_remaining -= 1;
                let remaining = self.recovery_remaining;
                info!(remaining, "recovery hold");
                kinds.push(PolicyEventKind::RecoveryTick {
                    remaining_secs: remaining,
                });
                if remaining == 0 {
                    self.protection_count += 1;
                    self.restart_requested = true;
                    kinds.push(PolicyEventKind::RecoveryComplete);
                    return Some(Action::Restart);
                }
                None
            }
            ProtectionState::Protected if !self.fans_stopped && self.fan_stop_remaining > 0 => {
                self.fan_stop_remaining -= 1;
                let remaining = self.fan_stop_remaining;
                if remaining % 10 == 0 || remaining <= 5 {
                    debug!(remaining, "fan coast-down");
                }
                if remaining == 0 {
                    self.fans_stopped = true;
                    return Some(Action::StopFans);
                }
                None
            }
            _ => None,
        }
    }

    fn debug_active(&mut self, now: Instant) -> bool {
        match self.debug {
            DebugMode::Off => false,
            DebugMode::On {
                expires_at: Some(deadline),
            } if now >= deadline => {
                self.debug = DebugMode::Off;
                info!("policy debug mode expired");
                false
            }
            DebugMode::On { .. } => true,
        }
    }
}

struct PolicyInner {
    runtime: RuntimeConfig,
    collaborators: PolicyCollaborators,
    clock: MonotonicClock,
    state: Mutex<PolicyState>,
    events: EventHub<PolicyEvent>,
    timing: LoopTimingReporter,
    worker: Mutex<Option<WorkerHandle>>,
}

/// Voltage protection policy engine.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct PowerPolicy {
    inner: Arc<PolicyInner>,
}

impl std::fmt::Debug for PowerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerPolicy")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

impl PowerPolicy {
    /// Build the engine. A configuration found in the store replaces `defaults`; a missing
    /// or unreadable record keeps them.
    pub fn new(
        defaults: PolicyConfig,
        runtime: RuntimeConfig,
        collaborators: PolicyCollaborators,
    ) -> Result<Self> {
        defaults.validate()?;
        runtime.validate()?;
        let config = match &collaborators.store {
            Some(store) => match store.load_policy() {
                Ok(Some(saved)) => match saved.validate() {
                    Ok(()) => {
                        info!("loaded persisted policy configuration");
                        saved
                    }
                    Err(err) => {
                        warn!(error = %err, "persisted policy configuration rejected, using defaults");
                        defaults
                    }
                },
                Ok(None) => {
                    debug!("no persisted policy configuration, using defaults");
                    defaults
                }
                Err(err) => {
                    warn!(error = %err, "policy configuration store unavailable, using defaults");
                    defaults
                }
            },
            None => defaults,
        };

        info!(
            low = config.low_voltage_threshold,
            recovery = config.recovery_voltage_threshold,
            shutdown_delay_secs = config.shutdown_delay_secs,
            recovery_hold_secs = config.recovery_hold_secs,
            "power policy initialised"
        );

        Ok(Self {
            inner: Arc::new(PolicyInner {
                timing: LoopTimingReporter::new(runtime.tick_interval),
                runtime,
                collaborators,
                clock: MonotonicClock::new(),
                state: Mutex::new(PolicyState::new(config)),
                events: EventHub::default(),
                worker: Mutex::new(None),
            }),
        })
    }

    /// Spawn the tick worker on the current tokio runtime. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.inner.worker.lock();
        if worker.as_ref().is_some_and(|w| w.is_running()) {
            debug!("power policy already running");
            return Ok(());
        }
        let weak: Weak<PolicyInner> = Arc::downgrade(&self.inner);
        let handle = spawn_periodic(WORKER_NAME, self.inner.runtime.tick_interval, move |_| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.timing.record_tick();
            match inner.tick(Instant::now()) {
                // platform calls may block for up to the liveness timeout
                Some(Action::Shutdown) => {
                    tokio::task::spawn_blocking(move || inner.perform(Action::Shutdown));
                }
                Some(action) => inner.perform(action),
                None => {}
            }
        })?;
        *worker = Some(handle);
        info!("power policy monitoring started");
        Ok(())
    }

    pub fn stop(&self) {
        let Some(handle) = self.inner.worker.lock().take() else {
            return;
        };
        handle.stop();
        match self.inner.timing.summary() {
            Some(summary) => info!(
                ticks = summary.samples,
                mean_jitter_us = summary.mean_us,
                max_jitter_us = summary.max_us,
                "power policy monitoring stopped"
            ),
            None => info!("power policy monitoring stopped"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .worker
            .lock()
            .as_ref()
            .is_some_and(|w| w.is_running())
    }

    /// Evaluate one tick on the caller's thread.
    pub fn process_tick(&self) {
        if let Some(action) = self.inner.tick(Instant::now()) {
            self.inner.perform(action);
        }
    }

    pub fn state(&self) -> ProtectionState {
        self.inner.state.lock().state
    }

    pub fn state_name(&self) -> &'static str {
        self.state().display_name()
    }

    pub fn status(&self) -> PolicyStatus {
        let mut state = self.inner.state.lock();
        self.inner.snapshot(&mut state, Instant::now())
    }

    pub fn config(&self) -> PolicyConfig {
        self.inner.state.lock().config.clone()
    }

    pub fn should_auto_start(&self) -> bool {
        self.inner.state.lock().config.auto_start
    }

    /// `(low, recovery)` thresholds in volts.
    pub fn thresholds(&self) -> (f64, f64) {
        let state = self.inner.state.lock();
        (
            state.config.low_voltage_threshold,
            state.config.recovery_voltage_threshold,
        )
    }

    pub fn set_thresholds(&self, low: f64, recovery: f64) -> Result<()> {
        validate_policy_thresholds(low, recovery)?;
        {
            let mut state = self.inner.state.lock();
            state.config.low_voltage_threshold = low;
            state.config.recovery_voltage_threshold = recovery;
        }
        info!(low, recovery, "policy thresholds updated");
        Ok(())
    }

    pub fn set_shutdown_delay(&self, secs: u32) -> Result<()> {
        validate_shutdown_delay(secs)?;
        self.inner.state.lock().config.shutdown_delay_secs = secs;
        info!(secs, "shutdown delay updated");
        Ok(())
    }

    pub fn set_recovery_hold(&self, secs: u32) -> Result<()> {
        validate_recovery_hold(secs)?;
        self.inner.state.lock().config.recovery_hold_secs = secs;
        info!(secs, "recovery hold updated");
        Ok(())
    }

    pub fn set_fan_stop_delay(&self, secs: u32) -> Result<()> {
        validate_fan_stop_delay(secs)?;
        self.inner.state.lock().config.fan_stop_delay_secs = secs;
        info!(secs, "fan stop delay updated");
        Ok(())
    }

    pub fn set_auto_recovery(&self, enabled: bool) {
        self.inner.state.lock().config.auto_recovery_enabled = enabled;
    }

    pub fn set_device_shutdown(&self, enabled: bool) {
        self.inner.state.lock().config.enable_device_shutdown = enabled;
    }

    pub fn set_fan_control(&self, enabled: bool) {
        self.inner.state.lock().config.enable_fan_control = enabled;
    }

    pub fn set_liveness_check(&self, enabled: bool) {
        self.inner.state.lock().config.liveness_check_before_shutdown = enabled;
    }

    pub fn set_auto_start(&self, enabled: bool) {
        self.inner.state.lock().config.auto_start = enabled;
    }

    /// Persist the current configuration.
    pub fn save_config(&self) -> Result<()> {
        let store = self.store()?;
        let config = self.config();
        store.save_policy(&config)?;
        info!("policy configuration saved");
        Ok(())
    }

    /// Replace the in-memory configuration with the persisted one. Returns `false` when
    /// nothing has been saved, leaving the current configuration in place.
    pub fn reload_config(&self) -> Result<bool> {
        let store = self.store()?;
        let Some(saved) = store.load_policy()? else {
            return Ok(false);
        };
        saved.validate()?;
        self.inner.state.lock().config = saved;
        info!("policy configuration reloaded");
        Ok(true)
    }

    fn store(&self) -> Result<&Arc<dyn ConfigStore>> {
        self.inner
            .collaborators
            .store
            .as_ref()
            .ok_or_else(|| PolicyError::InvalidState("no configuration store attached".into()))
    }

    /// Force a LOW_VOLTAGE entry by simulating a reading just under the low threshold.
    ///
    /// The simulated reading stays in effect until [`PowerPolicy::cancel_test`] or restart.
    pub fn trigger_test(&self) -> Result<()> {
        if !self.is_running() {
            return Err(PolicyError::InvalidState(
                "test trigger requires a running policy engine".into(),
            ));
        }
        let event = {
            let mut state = self.inner.state.lock();
            let simulated = state.config.low_voltage_threshold - TEST_VOLTAGE_OFFSET;
            state.test_voltage = Some(simulated);
            warn!(
                simulated,
                threshold = state.config.low_voltage_threshold,
                "protection rehearsal activated"
            );
            let status = self.inner.snapshot(&mut state, Instant::now());
            PolicyEvent {
                kind: PolicyEventKind::TestTriggered {
                    simulated_voltage: simulated,
                },
                status,
            }
        };
        self.inner.events.emit(event);
        Ok(())
    }

    /// End rehearsal mode. Returns whether it was active.
    pub fn cancel_test(&self) -> bool {
        let was_active = self.inner.state.lock().test_voltage.take().is_some();
        if was_active {
            info!("protection rehearsal cancelled");
        }
        was_active
    }

    /// Clear any protection state and restart the process.
    pub fn reset(&self) {
        {
            let mut state = self.inner.state.lock();
            state.test_voltage = None;
            state.state = ProtectionState::Normal;
            state.countdown_remaining = 0;
            state.recovery_remaining = 0;
        }
        warn!("protection reset requested, restarting");
        self.inner
            .collaborators
            .process
            .restart("protection reset requested");
    }

    /// Emit a `DebugTick` every tick, optionally only for `duration`.
    pub fn set_debug_mode(&self, enable: bool, duration: Option<Duration>) {
        let mode = if enable {
            DebugMode::On {
                expires_at: duration.map(|d| Instant::now() + d),
            }
        } else {
            DebugMode::Off
        };
        self.inner.state.lock().debug = mode;
        info!(enable, duration_secs = duration.map(|d| d.as_secs()), "policy debug mode");
    }

    pub fn is_debug_mode(&self) -> bool {
        self.inner.state.lock().debug_active(Instant::now())
    }

    /// Install the event callback, replacing any previous one.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&PolicyEvent) + Send + Sync + 'static,
    {
        self.inner.events.register(callback);
    }

    pub fn unregister_callback(&self) {
        self.inner.events.unregister();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.inner.events.subscribe()
    }
}

impl PolicyInner {
    fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(|w| w.is_running())
    }

    fn snapshot(&self, state: &mut PolicyState, now: Instant) -> PolicyStatus {
        PolicyStatus {
            state: state.state,
            state_name: state.state.display_name(),
            running: self.is_running(),
            current_voltage: state.current_voltage,
            countdown_remaining_secs: state.countdown_remaining,
            recovery_timer_remaining_secs: state.recovery_remaining,
            fan_stop_remaining_secs: state.fan_stop_remaining,
            protection_count: state.protection_count,
            uptime_ms: self.clock.now_ms(),
            device_status: state.device_status,
            test_mode: state.test_voltage.is_some(),
            debug_mode: state.debug_active(now),
        }
    }

    fn emit_all(&self, kinds: Vec<PolicyEventKind>, status: &PolicyStatus) {
        for kind in kinds {
            self.events.emit(PolicyEvent {
                kind,
                status: status.clone(),
            });
        }
    }

    /// Evaluate one tick and return the side effect it committed to.
    fn tick(&self, now: Instant) -> Option<Action> {
        let device_status = self.collaborators.platform.device_status();
        let reading = self.collaborators.voltage.latest_voltage();

        let mut kinds = Vec::new();
        let (action, status) = {
            let mut state = self.state.lock();
            if state.restart_requested {
                return None;
            }
            match device_status {
                Ok(devices) => state.device_status = devices,
                Err(err) => debug!(error = %err, "device status unavailable"),
            }

            let input = match state.test_voltage {
                Some(simulated) => Some(simulated),
                None => self.plausible(&mut state, reading),
            };
            if let Some(voltage) = input {
                state.current_voltage = voltage;
                state.evaluate(voltage, &mut kinds);
            }

            let action = state.advance_timers(&mut kinds);
            if state.debug_active(now) {
                kinds.push(PolicyEventKind::DebugTick);
            }
            (action, self.snapshot(&mut state, now))
        };
        self.emit_all(kinds, &status);
        action
    }

    fn perform(&self, action: Action) {
        match action {
            Action::Shutdown => self.complete_shutdown(),
            Action::StopFans => {
                warn!("stopping cooling fans");
                if let Err(err) = self.collaborators.platform.set_fans(false) {
                    error!(error = %err, "failed to stop cooling fans");
                }
            }
            Action::Restart => {
                info!("supply voltage stable, restarting to restore devices");
                if let Some(worker) = self.worker.lock().as_ref() {
                    worker.stop();
                }
                self.collaborators
                    .process
                    .restart("supply voltage recovered");
            }
        }
    }

    /// Filter a raw reading through the plausibility floor, falling back to the last
    /// known-good value.
    fn plausible(&self, state: &mut PolicyState, reading: Option<f64>) -> Option<f64> {
        let floor = self.runtime.min_valid_voltage;
        match reading {
            Some(voltage) if voltage.is_finite() && voltage >= floor => {
                if state.invalid_streak > 0 {
                    info!(voltage, after = state.invalid_streak, "voltage reading recovered");
                    state.invalid_streak = 0;
                }
                state.last_good_voltage = Some(voltage);
                Some(voltage)
            }
            other => {
                state.invalid_streak += 1;
                let streak = state.invalid_streak;
                if streak == 1 || streak % 10 == 0 {
                    warn!(reading = ?other, floor, count = streak, "implausible voltage reading ignored");
                }
                state.last_good_voltage
            }
        }
    }

    /// Run the shutdown sequence and commit SHUTDOWN -> PROTECTED.
    fn complete_shutdown(&self) {
        let (config, devices) = {
            let state = self.state.lock();
            (state.config.clone(), state.device_status)
        };
        warn!("executing protective shutdown");
        let platform = &self.collaborators.platform;
        let bound = self.runtime.liveness_timeout;

        if config.liveness_check_before_shutdown {
            self.graceful_shutdown(ManagedDevice::DeviceA, devices.device_a_connected, bound);
        }

        if config.enable_device_shutdown {
            for device in ManagedDevice::ALL {
                match platform.set_power(device, false) {
                    Ok(()) => info!(%device, "power rail cut"),
                    Err(err) => error!(%device, error = %err, "failed to cut power rail"),
                }
            }
        } else {
            info!("device shutdown disabled, rails left energised");
        }

        let mut kinds = Vec::new();
        let status = {
            let mut state = self.state.lock();
            if config.enable_fan_control {
                state.fan_stop_remaining = config.fan_stop_delay_secs;
                state.fans_stopped = false;
                info!(secs = config.fan_stop_delay_secs, "fan coast-down started");
            } else {
                state.fan_stop_remaining = 0;
            }
            state.enter(ProtectionState::Protected, &mut kinds);
            kinds.push(PolicyEventKind::Protected);
            self.snapshot(&mut state, Instant::now())
        };
        warn!("entered protected state");
        self.emit_all(kinds, &status);
    }

    fn graceful_shutdown(&self, device: ManagedDevice, connected: bool, bound: Duration) {
        if !connected {
            info!(%device, "device already disconnected, skipping liveness check");
            return;
        }
        let platform = &self.collaborators.platform;
        let started = Instant::now();
        match platform.is_reachable(device, bound) {
            Ok(true) => {
                let remaining = bound.saturating_sub(started.elapsed());
                match platform.request_graceful_shutdown(device, remaining) {
                    Ok(()) => info!(%device, "graceful shutdown requested"),
                    Err(err) => error!(%device, error = %err, "graceful shutdown request failed"),
                }
            }
            Ok(false) => info!(%device, "device unreachable, proceeding to rail cutoff"),
            Err(err) => error!(%device, error = %err, "liveness check failed"),
        }
        let elapsed = started.elapsed();
        if elapsed > bound {
            warn!(%device, elapsed_ms = elapsed.as_millis() as u64, "liveness handling exceeded its bound");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(config: PolicyConfig) -> PolicyState {
        PolicyState::new(config)
    }

    #[test]
    fn normal_enters_low_voltage_below_threshold() {
        let mut state = state_with(PolicyConfig::default());
        let mut kinds = Vec::new();
        state.evaluate(12.0, &mut kinds);
        assert_eq!(state.state, ProtectionState::LowVoltage);
        assert_eq!(state.countdown_remaining, 60);
        assert_eq!(
            kinds,
            vec![
                PolicyEventKind::StateChanged {
                    from: ProtectionState::Normal,
                    to: ProtectionState::LowVoltage
                },
                PolicyEventKind::LowVoltage { voltage: 12.0 },
            ]
        );
    }

    #[test]
    fn protected_waits_when_auto_recovery_disabled() {
        let mut state = state_with(PolicyConfig {
            auto_recovery_enabled: false,
            ..PolicyConfig::default()
        });
        state.state = ProtectionState::Protected;
        let mut kinds = Vec::new();
        state.evaluate(24.0, &mut kinds);
        assert_eq!(state.state, ProtectionState::Protected);
        assert!(kinds.is_empty());
    }

    #[test]
    fn fan_timer_fires_once() {
        let mut state = state_with(PolicyConfig::default());
        state.state = ProtectionState::Protected;
        state.fan_stop_remaining = 2;
        let mut kinds = Vec::new();
        assert_eq!(state.advance_timers(&mut kinds), None);
        assert_eq!(state.advance_timers(&mut kinds), Some(Action::StopFans));
        assert_eq!(state.advance_timers(&mut kinds), None);
        assert!(state.fans_stopped);
    }

    #[test]
    fn debug_mode_expires() {
        let mut state = state_with(PolicyConfig::default());
        let now = Instant::now();
        state.debug = DebugMode::On {
            expires_at: Some(now + Duration::from_secs(2)),
        };
        assert!(state.debug_active(now));
        assert!(!state.debug_active(now + Duration::from_secs(3)));
        assert_eq!(state.debug, DebugMode::Off);
    }
}
