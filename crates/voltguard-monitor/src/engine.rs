//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Sampling and telemetry protocol engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use voltguard_common::config::{validate_alarm_thresholds, validate_sample_interval};
use voltguard_common::{EventHub, MonitorConfig, MonotonicClock};
use voltguard_rt::{spawn_periodic, WorkerHandle};

use crate::errors::{MonitorError, Result};
use crate::events::MonitorEvent;
use crate::hal::{AnalogChannel, SerialSource};
use crate::protocol::{decode_frame, ProtocolError, TelemetryFrame, FRAME_LEN};
use crate::sampler::{VoltageSample, VoltageSampler};
use crate::stats::{RunningStatistics, StatsAccumulator};

const SERIAL_CHUNK: usize = 64;
const PENDING_CAP: usize = 256;
const WORKER_NAME: &str = "power-monitor";

#[derive(Debug, Clone, Copy)]
struct Settings {
    sample_interval: Duration,
    min_voltage: f64,
    max_voltage: f64,
    threshold_alarm: bool,
    protocol_debug: bool,
    telemetry_timeout: Duration,
    change_trace_threshold: f64,
}

struct MonitorState {
    settings: Settings,
    latest_voltage: Option<VoltageSample>,
    latest_telemetry: Option<TelemetryFrame>,
    stats: StatsAccumulator,
    last_sample_at: Option<Instant>,
    last_frame_at: Instant,
    timeout_reported: bool,
}

struct SerialPort {
    source: Box<dyn SerialSource>,
    pending: Vec<u8>,
}

struct MonitorInner {
    sampler: VoltageSampler,
    poll_interval: Duration,
    clock: MonotonicClock,
    state: Mutex<MonitorState>,
    channel: Mutex<Box<dyn AnalogChannel>>,
    serial: Option<Mutex<SerialPort>>,
    events: EventHub<MonitorEvent>,
    worker: Mutex<Option<WorkerHandle>>,
}

/// Sampling & protocol engine.
///
/// Cloning yields another handle to the same engine. The background worker stops once
/// [`PowerMonitor::stop`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct PowerMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for PowerMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerMonitor")
            .field("running", &self.is_running())
            .field("telemetry", &self.inner.serial.is_some())
            .finish()
    }
}

impl PowerMonitor {
    /// Build an engine from validated configuration. `serial` may be omitted on boards
    /// without a power-delivery chip.
    pub fn new(
        config: &MonitorConfig,
        channel: Box<dyn AnalogChannel>,
        serial: Option<Box<dyn SerialSource>>,
    ) -> Result<Self> {
        config.validate()?;
        let now = Instant::now();
        let settings = Settings {
            sample_interval: config.sample_interval,
            min_voltage: config.min_voltage,
            max_voltage: config.max_voltage,
            threshold_alarm: config.threshold_alarm,
            protocol_debug: config.protocol_debug,
            telemetry_timeout: config.telemetry_timeout,
            change_trace_threshold: config.change_trace_threshold,
        };
        let sampler = VoltageSampler::new(config);
        info!(
            divider_ratio = config.divider_ratio,
            calibrated = sampler.is_calibrated(),
            sample_interval_ms = config.sample_interval.as_millis() as u64,
            telemetry = serial.is_some(),
            "power monitor initialised"
        );
        Ok(Self {
            inner: Arc::new(MonitorInner {
                sampler,
                poll_interval: config.poll_interval,
                clock: MonotonicClock::new(),
                state: Mutex::new(MonitorState {
                    settings,
                    latest_voltage: None,
                    latest_telemetry: None,
                    stats: StatsAccumulator::new(now),
                    last_sample_at: None,
                    last_frame_at: now,
                    timeout_reported: false,
                }),
                channel: Mutex::new(channel),
                serial: serial.map(|source| {
                    Mutex::new(SerialPort {
                        source,
                        pending: Vec::with_capacity(PENDING_CAP),
                    })
                }),
                events: EventHub::default(),
                worker: Mutex::new(None),
            }),
        })
    }

    /// Spawn the background worker on the current tokio runtime. Calling it while the
    /// worker is already running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.inner.worker.lock();
        if worker.as_ref().is_some_and(|w| w.is_running()) {
            debug!("power monitor already running");
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock();
            state.last_frame_at = Instant::now();
            state.timeout_reported = false;
        }
        let period = self.inner.worker_period(self.sample_interval());
        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        let handle = spawn_periodic(WORKER_NAME, period, move |tick| {
            if let Some(inner) = weak.upgrade() {
                inner.run_cycle(tick.into_std());
            }
        })?;
        *worker = Some(handle);
        info!("power monitor started");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.inner.worker.lock().take() {
            handle.stop();
            info!("power monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .worker
            .lock()
            .as_ref()
            .is_some_and(|w| w.is_running())
    }

    /// Acquire one sample synchronously and store it as the latest value.
    pub fn read_voltage_now(&self) -> Result<VoltageSample> {
        let sample = self.inner.acquire()?;
        self.inner.state.lock().latest_voltage = Some(sample);
        Ok(sample)
    }

    /// Most recent sample without touching the hardware.
    pub fn cached_voltage(&self) -> Result<VoltageSample> {
        self.inner
            .state
            .lock()
            .latest_voltage
            .ok_or(MonitorError::NotAvailable("voltage sample"))
    }

    /// Most recent frame that passed its checksum.
    pub fn latest_telemetry(&self) -> Result<TelemetryFrame> {
        self.inner
            .state
            .lock()
            .latest_telemetry
            .ok_or(MonitorError::NotAvailable("telemetry frame"))
    }

    pub fn statistics(&self) -> RunningStatistics {
        self.inner.state.lock().stats.snapshot(Instant::now())
    }

    /// Zero every counter and restart the uptime clock. Cached values are kept.
    pub fn reset_statistics(&self) {
        self.inner.state.lock().stats = StatsAccumulator::new(Instant::now());
        info!("power monitor statistics reset");
    }

    pub fn set_sample_interval(&self, interval: Duration) -> Result<()> {
        validate_sample_interval(interval)?;
        self.inner.state.lock().settings.sample_interval = interval;
        if let Some(worker) = self.inner.worker.lock().as_ref() {
            worker.set_period(self.inner.worker_period(interval))?;
        }
        info!(sample_interval_ms = interval.as_millis() as u64, "sample interval updated");
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        self.inner.state.lock().settings.sample_interval
    }

    pub fn set_thresholds(&self, min_voltage: f64, max_voltage: f64) -> Result<()> {
        validate_alarm_thresholds(min_voltage, max_voltage)?;
        {
            let mut state = self.inner.state.lock();
            state.settings.min_voltage = min_voltage;
            state.settings.max_voltage = max_voltage;
        }
        info!(min_voltage, max_voltage, "alarm thresholds updated");
        Ok(())
    }

    /// Current `(min, max)` alarm band.
    pub fn thresholds(&self) -> (f64, f64) {
        let settings = self.inner.state.lock().settings;
        (settings.min_voltage, settings.max_voltage)
    }

    pub fn set_threshold_alarm(&self, enabled: bool) {
        self.inner.state.lock().settings.threshold_alarm = enabled;
    }

    pub fn set_protocol_debug(&self, enabled: bool) {
        self.inner.state.lock().settings.protocol_debug = enabled;
        info!(enabled, "protocol debug toggled");
    }

    /// Install the event callback, replacing any previous one. The callback runs on the
    /// worker thread and delays the next cycle while it executes.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        self.inner.events.register(callback);
    }

    pub fn unregister_callback(&self) {
        self.inner.events.unregister();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    /// Run one worker iteration on the caller's thread.
    pub fn run_cycle(&self) {
        self.inner.run_cycle(Instant::now());
    }

    /// Drain the serial source and decode every complete frame. Returns the number of
    /// frames decoded, valid or not.
    pub fn poll_telemetry(&self) -> usize {
        self.inner.poll_telemetry(Instant::now())
    }
}

impl MonitorInner {
    /// The worker wakes often enough to honour both the telemetry poll and the sample
    /// interval.
    fn worker_period(&self, sample_interval: Duration) -> Duration {
        self.poll_interval.min(sample_interval)
    }

    fn run_cycle(&self, now: Instant) {
        let due = {
            let state = self.state.lock();
            state
                .last_sample_at
                .map_or(true, |last| now.saturating_duration_since(last) >= state.settings.sample_interval)
        };
        if due {
            self.sample_tick(now);
        }
        self.poll_telemetry(now);
    }

    fn acquire(&self) -> Result<VoltageSample> {
        let raw = self.channel.lock().read_raw()?;
        Ok(self.sampler.convert(raw, self.clock.now_ms()))
    }

    fn sample_tick(&self, now: Instant) {
        let result = self.acquire();
        let mut breach = None;
        let mut change = None;
        let mut failures = 0;
        {
            let mut state = self.state.lock();
            state.last_sample_at = Some(now);
            match &result {
                Ok(sample) => {
                    let previous = state.latest_voltage.map(|s| s.voltage);
                    state.latest_voltage = Some(*sample);
                    state.stats.record_sample(sample.voltage);
                    let settings = state.settings;
                    if settings.threshold_alarm
                        && (sample.voltage < settings.min_voltage
                            || sample.voltage > settings.max_voltage)
                    {
                        state.stats.record_violation();
                        breach = Some(MonitorEvent::ThresholdBreach {
                            sample: *sample,
                            min_voltage: settings.min_voltage,
                            max_voltage: settings.max_voltage,
                        });
                    }
                    if let Some(prev) = previous {
                        if prev > 0.0
                            && (sample.voltage - prev).abs() > settings.change_trace_threshold
                        {
                            change = Some(prev);
                        }
                    }
                }
                Err(_) => failures = state.stats.record_hardware_error(),
            }
        }

        match result {
            Ok(sample) => {
                if let Some(prev) = change {
                    debug!(from = prev, to = sample.voltage, "supply voltage changed");
                }
                if let Some(event) = breach {
                    warn!(voltage = sample.voltage, "supply voltage outside alarm band");
                    self.events.emit(event);
                }
            }
            Err(err) => {
                if failures == 1 || failures % 10 == 0 {
                    warn!(error = %err, failures, "voltage acquisition failed");
                }
            }
        }
    }

    fn poll_telemetry(&self, now: Instant) -> usize {
        let Some(serial) = &self.serial else {
            return 0;
        };

        let mut frames = Vec::new();
        let mut read_error = None;
        {
            let mut port = serial.lock();
            let mut chunk = [0u8; SERIAL_CHUNK];
            while port.pending.len() < PENDING_CAP {
                let room = (PENDING_CAP - port.pending.len()).min(SERIAL_CHUNK);
                match port.source.read_available(&mut chunk[..room]) {
                    Ok(0) => break,
                    Ok(n) => {
                        port.pending.extend_from_slice(&chunk[..n]);
                        if n < room {
                            break;
                        }
                    }
                    Err(err) => {
                        read_error = Some(err);
                        break;
                    }
                }
            }

            let timestamp_ms = self.clock.now_ms();
            while port.pending.len() >= FRAME_LEN {
                match decode_frame(&port.pending, timestamp_ms) {
                    Ok(decoded) => {
                        port.pending.drain(..decoded.consumed());
                        frames.push(decoded.frame);
                    }
                    Err(ProtocolError::NoHeader { scanned }) => {
                        port.pending.drain(..scanned);
                    }
                    Err(ProtocolError::NoFrame { offset, .. }) => {
                        port.pending.drain(..offset);
                        break;
                    }
                    Err(ProtocolError::ChecksumMismatch { .. }) => break,
                }
            }
        }

        let mut events = Vec::with_capacity(frames.len());
        let mut failures = 0;
        let protocol_debug;
        {
            let mut state = self.state.lock();
            protocol_debug = state.settings.protocol_debug;
            if read_error.is_some() {
                failures = state.stats.record_hardware_error();
            }
            if frames.is_empty() {
                let silent = now.saturating_duration_since(state.last_frame_at);
                if !state.timeout_reported && silent > state.settings.telemetry_timeout {
                    state.timeout_reported = true;
                    state.stats.record_timeout();
                    events.push(MonitorEvent::TelemetryTimeout {
                        silent_ms: voltguard_common::time::duration_to_millis(silent),
                    });
                }
            } else {
                state.last_frame_at = now;
                state.timeout_reported = false;
                for frame in &frames {
                    state.stats.record_frame(frame);
                    if frame.checksum_valid {
                        state.latest_telemetry = Some(*frame);
                        events.push(MonitorEvent::TelemetryReceived { frame: *frame });
                    } else {
                        events.push(MonitorEvent::ChecksumError { frame: *frame });
                    }
                }
            }
        }

        if let Some(err) = read_error {
            if failures == 1 || failures % 10 == 0 {
                warn!(error = %err, failures, "telemetry read failed");
            }
        }
        if protocol_debug {
            for frame in &frames {
                info!(
                    voltage = frame.voltage,
                    current = frame.current,
                    power = frame.power,
                    checksum_ok = frame.checksum_valid,
                    raw = ?frame.raw,
                    "power chip frame"
                );
            }
        }
        for event in events {
            if let MonitorEvent::TelemetryTimeout { silent_ms } = &event {
                warn!(silent_ms = *silent_ms, "power chip telemetry timed out");
            }
            self.events.emit(event);
        }
        frames.len()
    }
}
