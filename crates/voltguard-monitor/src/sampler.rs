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
use voltguard_common::{CalibrationPoint, MonitorConfig};

/// One supply voltage acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoltageSample {
    /// Supply voltage after the divider ratio is applied.
    pub voltage: f64,
    pub raw_count: u16,
    /// Voltage at the ADC pin.
    pub millivolts: u32,
    pub timestamp_ms: u64,
}

/// Converts raw ADC counts into supply volts.
#[derive(Debug, Clone)]
pub struct VoltageSampler {
    divider_ratio: f64,
    reference_mv: u32,
    max_count: u32,
    curve: Vec<CalibrationPoint>,
}

impl VoltageSampler {
    pub fn new(config: &MonitorConfig) -> Self {
        let mut curve = config.calibration.clone();
        curve.sort_by_key(|p| p.raw);
        curve.dedup_by_key(|p| p.raw);
        Self {
            divider_ratio: config.divider_ratio,
            reference_mv: config.adc_reference_mv,
            max_count: config.adc_max_count(),
            curve,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.curve.len() >= 2
    }

    /// Pin voltage in millivolts for `raw`.
    ///
    /// With at least two calibration points the curve is interpolated piecewise and
    /// extrapolated from the nearest segment; otherwise counts scale linearly against
    /// the reference voltage.
    pub fn to_millivolts(&self, raw: u16) -> u32 {
        if !self.is_calibrated() {
            let mv = u64::from(raw) * u64::from(self.reference_mv) / u64::from(self.max_count.max(1));
            return u32::try_from(mv).unwrap_or(u32::MAX);
        }
        let idx = self
            .curve
            .windows(2)
            .position(|pair| raw <= pair[1].raw)
            .unwrap_or(self.curve.len() - 2);
        let (lo, hi) = (self.curve[idx], self.curve[idx + 1]);
        let span = f64::from(hi.raw) - f64::from(lo.raw);
        let slope = (f64::from(hi.millivolts) - f64::from(lo.millivolts)) / span;
        let mv = f64::from(lo.millivolts) + slope * (f64::from(raw) - f64::from(lo.raw));
        mv.round().clamp(0.0, f64::from(u32::MAX)) as u32
    }

    pub fn convert(&self, raw: u16, timestamp_ms: u64) -> VoltageSample {
        let millivolts = self.to_millivolts(raw);
        VoltageSample {
            voltage: f64::from(millivolts) / 1000.0 * self.divider_ratio,
            raw_count: raw,
            millivolts,
            timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_conversion_uses_reference_and_divider() {
        let sampler = VoltageSampler::new(&MonitorConfig::default());
        assert!(!sampler.is_calibrated());
        let full = sampler.convert(4095, 0);
        assert_eq!(full.millivolts, 3300);
        assert!((full.voltage - 37.62).abs() < 1e-9);
        // 2.106 V at the pin is 24.0 V on the rail
        let nominal = sampler.convert(2613, 7);
        assert_eq!(nominal.millivolts, 2105);
        assert_eq!(nominal.timestamp_ms, 7);
        assert_eq!(sampler.convert(0, 0).voltage, 0.0);
    }

    #[test]
    fn calibration_curve_interpolates() {
        let config = MonitorConfig {
            calibration: vec![
                CalibrationPoint { raw: 4000, millivolts: 3100 },
                CalibrationPoint { raw: 0, millivolts: 100 },
                CalibrationPoint { raw: 2000, millivolts: 1600 },
            ],
            divider_ratio: 10.0,
            ..MonitorConfig::default()
        };
        let sampler = VoltageSampler::new(&config);
        assert!(sampler.is_calibrated());
        assert_eq!(sampler.to_millivolts(0), 100);
        assert_eq!(sampler.to_millivolts(1000), 850);
        assert_eq!(sampler.to_millivolts(3000), 2350);
        // extrapolated from the last segment
        assert_eq!(sampler.to_millivolts(4095), 3171);
        assert!((sampler.convert(2000, 0).voltage - 16.0).abs() < 1e-9);
    }
}
