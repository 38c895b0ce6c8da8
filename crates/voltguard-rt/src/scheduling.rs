//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the sampling and policy workers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

/// Async interval that delays, rather than bursts, after a missed tick.
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    interval: tokio::time::Interval,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            interval: Self::build(period),
        }
    }

    fn build(period: Duration) -> tokio::time::Interval {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Switch to a new period starting one full `period` from now.
    ///
    /// Unchanged periods are ignored so a live interval keeps its phase.
    pub fn set_period(&mut self, period: Duration) {
        if period == self.period || period.is_zero() {
            return;
        }
        self.period = period;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = interval;
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_tick_is_immediate() {
        let mut limiter = RateLimiter::new(Duration::from_secs(1));
        let start = Instant::now();
        limiter.tick().await;
        assert!(start.elapsed() < Duration::from_millis(1));
        limiter.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn period_change_applies_from_next_tick() {
        let mut limiter = RateLimiter::new(Duration::from_secs(5));
        limiter.tick().await;
        limiter.set_period(Duration::from_millis(200));
        assert_eq!(limiter.period(), Duration::from_millis(200));
        let start = Instant::now();
        limiter.tick().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(200));
        assert!(waited < Duration::from_secs(5));
    }
}
