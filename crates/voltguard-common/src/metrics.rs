//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the power-integrity runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::time::jitter_us;

/// Incremental mean over an unbounded stream of readings.
///
/// Welford's update; no running sum is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    count: u64,
    mean: f64,
    m2: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count = self.count.saturating_add(1);
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean of all pushed values, `0.0` when empty.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample standard deviation, `0.0` with fewer than two values.
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JitterSummary {
    pub mean_us: f64,
    pub std_dev_us: f64,
    pub max_us: f64,
    pub min_us: f64,
    pub samples: u64,
}

/// Measures worker tick spacing against a target period.
#[derive(Debug)]
pub struct LoopTimingReporter {
    target_interval: Duration,
    last_tick: Mutex<Option<Instant>>,
    jitter: Mutex<RunningMean>,
}

impl LoopTimingReporter {
    pub fn new(target_interval: Duration) -> Self {
        Self {
            target_interval,
            last_tick: Mutex::new(None),
            jitter: Mutex::new(RunningMean::new()),
        }
    }

    pub fn target_interval(&self) -> Duration {
        self.target_interval
    }

    pub fn record_tick(&self) {
        self.record_tick_at(Instant::now());
    }

    pub fn record_tick_at(&self, now: Instant) {
        let mut last_tick = self.last_tick.lock();
        if let Some(previous) = *last_tick {
            let actual = now.saturating_duration_since(previous);
            let deviation_us = jitter_us(actual, self.target_interval).unsigned_abs();
            self.jitter.lock().push(deviation_us as f64);
        }
        *last_tick = Some(now);
    }

    pub fn summary(&self) -> Option<JitterSummary> {
        let jitter = self.jitter.lock();
        if jitter.count() == 0 {
            return None;
        }
        Some(JitterSummary {
            mean_us: jitter.mean(),
            std_dev_us: jitter.std_dev(),
            max_us: jitter.max().unwrap_or_default(),
            min_us: jitter.min().unwrap_or_default(),
            samples: jitter.count(),
        })
    }
}
