//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated supply, ADC channel and telemetry chip for the VoltGuard daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::prelude::*;
use rand_distr::Normal;
use voltguard_common::{MonitorConfig, SimulationConfig, SupplyProfile};
use voltguard_monitor::protocol::{encode_frame, AMPS_PER_UNIT, VOLTS_PER_UNIT};
use voltguard_monitor::{AnalogChannel, HalError, SerialSource};

/// Supply rail shared by the simulated ADC and the simulated telemetry chip.
#[derive(Debug)]
pub struct SimulatedSupply {
    settings: SimulationConfig,
    rng: StdRng,
    noise: Normal<f64>,
    start: Instant,
}

impl SimulatedSupply {
    pub fn new(settings: &SimulationConfig) -> Result<Arc<Mutex<Self>>> {
        let noise = Normal::new(0.0, settings.noise_sigma)
            .with_context(|| format!("invalid noise sigma {}", settings.noise_sigma))?;
        Ok(Arc::new(Mutex::new(Self {
            settings: settings.clone(),
            rng: StdRng::seed_from_u64(settings.random_seed),
            noise,
            start: Instant::now(),
        })))
    }

    /// Noise-free rail voltage `elapsed` after boot.
    pub fn profile_voltage(&self, elapsed: Duration) -> f64 {
        let s = &self.settings;
        match s.profile {
            SupplyProfile::Steady => s.nominal_voltage,
            SupplyProfile::Brownout => {
                let dip_end = s.brownout_after + s.brownout_duration;
                if elapsed >= s.brownout_after && elapsed < dip_end {
                    s.brownout_voltage
                } else {
                    s.nominal_voltage
                }
            }
        }
    }

    /// Current rail voltage with Gaussian noise, never negative.
    pub fn sample_voltage(&mut self) -> f64 {
        let clean = self.profile_voltage(self.start.elapsed());
        (clean + self.noise.sample(&mut self.rng)).max(0.0)
    }

    pub fn sample_current(&mut self) -> f64 {
        (self.settings.load_current + self.noise.sample(&mut self.rng) * 0.1).max(0.0)
    }
}

/// ADC pin behind the board's resistor divider.
pub struct SimulatedAdc {
    supply: Arc<Mutex<SimulatedSupply>>,
    divider_ratio: f64,
    reference_mv: f64,
    max_count: u32,
}

impl SimulatedAdc {
    pub fn new(supply: Arc<Mutex<SimulatedSupply>>, config: &MonitorConfig) -> Self {
        Self {
            supply,
            divider_ratio: config.divider_ratio,
            reference_mv: f64::from(config.adc_reference_mv),
            max_count: config.adc_max_count(),
        }
    }

    fn to_raw(&self, volts: f64) -> u16 {
        let pin_mv = volts / self.divider_ratio * 1000.0;
        let raw = (pin_mv / self.reference_mv * f64::from(self.max_count)).round();
        raw.clamp(0.0, f64::from(self.max_count)) as u16
    }
}

impl AnalogChannel for SimulatedAdc {
    fn read_raw(&mut self) -> Result<u16, HalError> {
        let volts = self.supply.lock().sample_voltage();
        Ok(self.to_raw(volts))
    }
}

/// Power-delivery chip that streams one telemetry frame per `frame_period`.
pub struct SimulatedTelemetry {
    supply: Arc<Mutex<SimulatedSupply>>,
    frame_period: Duration,
    last_frame: Option<Instant>,
}

impl SimulatedTelemetry {
    pub fn new(supply: Arc<Mutex<SimulatedSupply>>, frame_period: Duration) -> Self {
        Self {
            supply,
            frame_period,
            last_frame: None,
        }
    }
}

fn to_units(value: f64, per_unit: f64) -> u8 {
    (value / per_unit).round().clamp(0.0, f64::from(u8::MAX)) as u8
}

impl SerialSource for SimulatedTelemetry {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, HalError> {
        let now = Instant::now();
        if self
            .last_frame
            .is_some_and(|at| now.duration_since(at) < self.frame_period)
        {
            return Ok(0);
        }
        let frame = {
            let mut supply = self.supply.lock();
            let volts = supply.sample_voltage();
            let amps = supply.sample_current();
            encode_frame(to_units(volts, VOLTS_PER_UNIT), to_units(amps, AMPS_PER_UNIT))
        };
        if buf.len() < frame.len() {
            return Ok(0);
        }
        buf[..frame.len()].copy_from_slice(&frame);
        self.last_frame = Some(now);
        Ok(frame.len())
    }
}
