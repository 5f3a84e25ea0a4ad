//! Detection rate reporting.

use std::time::Duration;

/// Instantaneous detection rate derived from the most recent cycle.
///
/// Only the latest sample is kept; there is no smoothing window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RateMonitor {
    fps: u32,
}

impl RateMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed cycle and return the new rate.
    ///
    /// Computed as `round(1000 / ms)` on the fractional duration. A zero
    /// duration reports 0 rather than an unbounded rate.
    pub fn record(&mut self, cycle: Duration) -> u32 {
        let secs = cycle.as_secs_f64();
        self.fps = if secs == 0.0 {
            0
        } else {
            (1.0 / secs).round() as u32
        };
        self.fps
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn reset(&mut self) {
        self.fps = 0;
    }
}
