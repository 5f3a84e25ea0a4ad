//! Single-flight periodic driver.
//!
//! `SingleFlightScheduler` calls a tick closure on a fixed period from one
//! driver thread. A tick that overruns its period makes the scheduler drop the
//! deadlines it missed instead of queueing them, so at most one tick is ever
//! running and ticks never pile up behind a slow detection request.

use anyhow::{anyhow, Context, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default detection period (5 cycles per second at most).
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Counters describing what the driver has done so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Ticks that ran to completion (successfully or not).
    pub ticks: u64,
    /// Deadlines dropped because a tick was still running.
    pub skipped: u64,
    /// Ticks that returned an error or panicked.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Gate {
    cancelled: bool,
    in_flight: bool,
}

#[derive(Debug, Default)]
struct Shared {
    gate: Mutex<Gate>,
    stats: Mutex<SchedulerStats>,
}

impl Shared {
    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stats(&self) -> MutexGuard<'_, SchedulerStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a tick as started unless the scheduler was cancelled.
    fn begin_tick(&self) -> bool {
        let mut gate = self.gate();
        if gate.cancelled {
            return false;
        }
        gate.in_flight = true;
        true
    }

    fn end_tick(&self) {
        self.gate().in_flight = false;
    }
}

/// Periodic driver that never runs two ticks at once.
///
/// Dropping the scheduler stops it.
#[derive(Debug)]
pub struct SingleFlightScheduler {
    interval: Duration,
    shared: Arc<Shared>,
    wake: Option<mpsc::Sender<()>>,
    driver: Option<JoinHandle<()>>,
}

impl SingleFlightScheduler {
    /// Start calling `on_tick` every `interval`.
    ///
    /// The first tick fires one interval after start. Errors returned by
    /// `on_tick` (and panics inside it) are logged and counted; the scheduler
    /// keeps running.
    pub fn start<F>(interval: Duration, on_tick: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(anyhow!("scheduler interval must be > 0"));
        }
        let shared = Arc::new(Shared::default());
        let (wake, wake_rx) = mpsc::channel();
        let driver_shared = shared.clone();
        let driver = thread::Builder::new()
            .name("detect-scheduler".to_string())
            .spawn(move || run_driver(interval, driver_shared, wake_rx, on_tick))
            .context("spawn scheduler thread")?;
        log::debug!("scheduler started (interval {:?})", interval);
        Ok(Self {
            interval,
            shared,
            wake: Some(wake),
            driver: Some(driver),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True until `stop` is called.
    pub fn is_running(&self) -> bool {
        self.driver.is_some() && !self.shared.gate().cancelled
    }

    /// True while a tick is executing.
    pub fn is_in_flight(&self) -> bool {
        self.shared.gate().in_flight
    }

    pub fn stats(&self) -> SchedulerStats {
        *self.shared.stats()
    }

    /// Cancel the timer. Idempotent.
    ///
    /// Once this returns no new tick will start. A tick already running is
    /// not interrupted: the driver finishes it and exits on its own, so this
    /// call never blocks on it (and may be made from inside a tick).
    pub fn stop(&mut self) {
        let in_flight = {
            let mut gate = self.shared.gate();
            gate.cancelled = true;
            gate.in_flight
        };
        self.wake.take();
        let Some(driver) = self.driver.take() else {
            return;
        };
        if in_flight || driver.thread().id() == thread::current().id() {
            log::debug!("scheduler stopped while a tick is running");
            return;
        }
        if driver.join().is_err() {
            log::warn!("scheduler driver thread panicked");
        }
        log::debug!("scheduler stopped");
    }
}

impl Drop for SingleFlightScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_driver<F>(
    interval: Duration,
    shared: Arc<Shared>,
    wake: mpsc::Receiver<()>,
    mut on_tick: F,
) where
    F: FnMut() -> Result<()>,
{
    let mut deadline = Instant::now() + interval;
    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        match wake.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if !shared.begin_tick() {
            break;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| on_tick()));
        shared.end_tick();
        {
            let mut stats = shared.stats();
            stats.ticks += 1;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    stats.failures += 1;
                    log::warn!("detection tick failed: {:#}", err);
                }
                Err(_) => {
                    stats.failures += 1;
                    log::error!("detection tick panicked");
                }
            }
        }

        deadline += interval;
        let now = Instant::now();
        if deadline <= now {
            let behind = (now - deadline).as_nanos();
            let period = interval.as_nanos();
            let missed = behind / period + 1;
            let into_period = Duration::from_nanos((behind % period) as u64);
            deadline = now + interval - into_period;
            shared.stats().skipped += missed as u64;
            log::trace!("scheduler skipped {} tick(s) behind a slow cycle", missed);
        }
    }
    log::trace!("scheduler driver exiting");
}
