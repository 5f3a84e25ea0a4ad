//! Camera sources.
//!
//! This module provides the live sources a detection loop can stream from:
//! - Synthetic test pattern (`stub://` device strings)
//! - HTTP MJPEG streams and JPEG snapshot URLs (`http://`, `https://`)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! All sources implement `VideoSource`. Network and device sources read on a
//! background thread and keep only the most recent picture, so a slow
//! detection loop never drains a backlog of stale frames.
//!
//! Sources MUST NOT:
//! - Store captured frames to disk
//! - Forward frames anywhere except through `FrameCapture`

use anyhow::{anyhow, Result};

use crate::frame::VideoSource;

pub mod mjpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
mod slot;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use mjpeg::MjpegSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Requested camera parameters.
///
/// The device may deliver a different native size; capture space always
/// follows what the device actually delivers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraConfig {
    /// `stub://name`, `http(s)://host/stream` or a V4L2 path such as `/dev/video0`.
    pub device: String,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
    /// Preferred device frame rate.
    pub target_fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "stub://webcam".to_string(),
            width: 1280,
            height: 720,
            target_fps: 30,
        }
    }
}

/// Something that can hand out a live `VideoSource`.
///
/// Acquisition failures (permission denied, missing device, unreachable
/// stream) are reported as errors and keep the controller idle.
pub trait CameraDevice: Send {
    /// Device identifier for logs and notifications.
    fn describe(&self) -> String;

    /// Open the device and start streaming.
    fn acquire(&mut self) -> Result<Box<dyn VideoSource>>;
}

/// Camera opened from a `CameraConfig`, dispatching on the device string.
#[derive(Clone, Debug)]
pub struct ConfiguredCamera {
    config: CameraConfig,
}

impl ConfiguredCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }
}

impl CameraDevice for ConfiguredCamera {
    fn describe(&self) -> String {
        self.config.device.clone()
    }

    fn acquire(&mut self) -> Result<Box<dyn VideoSource>> {
        open_source(&self.config)
    }
}

/// Open and connect the source named by `config.device`.
pub fn open_source(config: &CameraConfig) -> Result<Box<dyn VideoSource>> {
    let device = config.device.trim();
    if device.is_empty() {
        return Err(anyhow!("no camera device configured"));
    }
    if device.starts_with("stub://") {
        let mut source = SyntheticSource::new(config.clone());
        source.connect()?;
        return Ok(Box::new(source));
    }
    if device.starts_with("http://") || device.starts_with("https://") {
        let mut source = MjpegSource::new(config.clone())?;
        source.connect()?;
        return Ok(Box::new(source));
    }
    open_device(config)
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(config: &CameraConfig) -> Result<Box<dyn VideoSource>> {
    let mut source = V4l2Source::new(config.clone())?;
    source.connect()?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(config: &CameraConfig) -> Result<Box<dyn VideoSource>> {
    Err(anyhow!(
        "camera device '{}' requires the ingest-v4l2 feature",
        config.device
    ))
}
