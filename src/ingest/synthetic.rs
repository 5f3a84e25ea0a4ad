//! Synthetic camera (`stub://`).
//!
//! Produces a test pattern: a flat background with a square sweeping across
//! it, so overlays and encoders have something non-trivial to work on. The
//! source reports ready only after a short warm-up, like a real camera
//! filling its first buffers.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::time::{Duration, Instant};

use super::CameraConfig;
use crate::frame::VideoSource;

/// Number of device frame intervals a synthetic camera needs before it is ready.
const WARMUP_FRAMES: u32 = 3;

pub struct SyntheticSource {
    config: CameraConfig,
    warmup: Duration,
    connected_at: Option<Instant>,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: CameraConfig) -> Self {
        let warmup = if config.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(u64::from(1000 / config.target_fps) * u64::from(WARMUP_FRAMES))
        };
        Self {
            config,
            warmup,
            connected_at: None,
            frame_count: 0,
        }
    }

    /// Override the warm-up period.
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn connect(&mut self) -> Result<()> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(anyhow!(
                "synthetic camera {} needs a non-zero size",
                self.config.device
            ));
        }
        self.connected_at = Some(Instant::now());
        log::info!(
            "SyntheticSource: connected to {} ({}x{})",
            self.config.device,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn render_pattern(&self, elapsed: Duration) -> RgbImage {
        let (width, height) = (self.config.width, self.config.height);
        let side = (width.min(height) / 4).max(1);
        let travel = width.saturating_sub(side).max(1);
        // One sweep every four seconds.
        let phase = (elapsed.as_millis() % 4000) as u64;
        let left = (phase * u64::from(travel) / 4000) as u32;
        let top = (height - side.min(height)) / 2;

        RgbImage::from_fn(width, height, |x, y| {
            if x >= left && x < left + side && y >= top && y < top + side {
                Rgb([220, 60, 40])
            } else {
                Rgb([40, 48, 56])
            }
        })
    }
}

impl VideoSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.config.device
    }

    fn is_ready(&self) -> bool {
        self.connected_at
            .map(|at| at.elapsed() >= self.warmup)
            .unwrap_or(false)
    }

    fn capture_size(&self) -> (u32, u32) {
        if self.connected_at.is_some() {
            (self.config.width, self.config.height)
        } else {
            (0, 0)
        }
    }

    fn snapshot(&mut self) -> Result<Option<RgbImage>> {
        let Some(connected_at) = self.connected_at else {
            return Ok(None);
        };
        self.frame_count += 1;
        Ok(Some(self.render_pattern(connected_at.elapsed())))
    }

    fn release(&mut self) {
        if self.connected_at.take().is_some() {
            log::info!("SyntheticSource: released {}", self.config.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> CameraConfig {
        CameraConfig {
            device: "stub://test".to_string(),
            width: 160,
            height: 120,
            target_fps: 30,
        }
    }

    #[test]
    fn synthetic_source_is_not_ready_before_warmup() -> Result<()> {
        let mut source =
            SyntheticSource::new(stub_config()).with_warmup(Duration::from_secs(3600));
        source.connect()?;
        assert!(!source.is_ready());
        Ok(())
    }

    #[test]
    fn synthetic_source_produces_native_size_pictures() -> Result<()> {
        let mut source = SyntheticSource::new(stub_config()).with_warmup(Duration::ZERO);
        source.connect()?;
        assert!(source.is_ready());

        let picture = source.snapshot()?.expect("picture");
        assert_eq!(picture.dimensions(), (160, 120));
        assert_eq!(source.frames_captured(), 1);
        Ok(())
    }

    #[test]
    fn released_source_stops_producing() -> Result<()> {
        let mut source = SyntheticSource::new(stub_config()).with_warmup(Duration::ZERO);
        source.connect()?;
        source.release();
        source.release();

        assert!(!source.is_ready());
        assert_eq!(source.capture_size(), (0, 0));
        assert!(source.snapshot()?.is_none());
        Ok(())
    }
}
