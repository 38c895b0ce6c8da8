//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the sampling and policy workers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::scheduling::RateLimiter;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {0} requires a running tokio runtime")]
    NoRuntime(&'static str),
    #[error("worker {0} period must be non-zero")]
    ZeroPeriod(&'static str),
}

/// Handle to a periodic background task.
///
/// The task checks its running flag at every iteration boundary, so [`WorkerHandle::stop`]
/// never interrupts an iteration that is already executing. Dropping the handle stops the
/// worker as well.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    running: Arc<AtomicBool>,
    shutdown: broadcast::Sender<()>,
    period: watch::Sender<Duration>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    pub fn period(&self) -> Duration {
        *self.period.borrow()
    }

    /// Change the iteration period. The next iteration runs one full `period` from now.
    pub fn set_period(&self, period: Duration) -> Result<(), WorkerError> {
        if period.is_zero() {
            return Err(WorkerError::ZeroPeriod(self.name));
        }
        if self.period.send_replace(period) != period {
            debug!(worker = self.name, period_ms = period.as_millis() as u64, "period changed");
        }
        Ok(())
    }

    /// Ask the worker to exit. Safe to call from any thread, any number of times.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!(worker = self.name, "stop requested");
        }
        let _ = self.shutdown.send(());
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn `body` on the current tokio runtime, invoking it once per `period`.
///
/// The first invocation happens immediately. Missed ticks are delayed rather than
/// replayed in a burst.
pub fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    mut body: F,
) -> Result<WorkerHandle, WorkerError>
where
    F: FnMut(Instant) + Send + 'static,
{
    if period.is_zero() {
        return Err(WorkerError::ZeroPeriod(name));
    }
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| WorkerError::NoRuntime(name))?;
    let running = Arc::new(AtomicBool::new(true));
    let (shutdown, mut shutdown_rx) = broadcast::channel(1);
    let (period_tx, mut period_rx) = watch::channel(period);
    let flag = running.clone();

    let task = runtime.spawn(async move {
        let mut limiter = RateLimiter::new(period);
        info!(worker = name, period_ms = period.as_millis() as u64, "worker started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                Ok(()) = period_rx.changed() => {
                    let next = *period_rx.borrow_and_update();
                    limiter.set_period(next);
                }
                now = limiter.tick() => {
                    if !flag.load(Ordering::SeqCst) {
                        break;
                    }
                    body(now);
                }
            }
        }
        flag.store(false, Ordering::SeqCst);
        info!(worker = name, "worker stopped");
    });

    Ok(WorkerHandle {
        name,
        running,
        shutdown,
        period: period_tx,
        task,
    })
}
