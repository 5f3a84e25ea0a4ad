//! V4L2 camera source.
//!
//! This module provides `V4l2Source` for local USB/V4L2 webcams.
//!
//! The device is opened and drained on a dedicated capture thread that keeps
//! only the newest picture. The loop samples that picture at its own pace, so
//! the driver's buffer queue never backs up with stale frames.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::slot::FrameSlot;
use super::CameraConfig;
use crate::frame::VideoSource;

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_BUFFERS: u32 = 2;

/// V4L2 camera.
pub struct V4l2Source {
    config: CameraConfig,
    slot: FrameSlot<RgbImage>,
    capture: Option<JoinHandle<()>>,
}

/// Negotiated device format.
#[derive(Clone, Copy, Debug)]
struct ActiveFormat {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl V4l2Source {
    pub fn new(config: CameraConfig) -> Result<Self> {
        Ok(Self {
            config,
            slot: FrameSlot::new(),
            capture: None,
        })
    }

    /// Open the device and start the capture thread.
    pub fn connect(&mut self) -> Result<()> {
        let (opened_tx, opened_rx) = mpsc::channel();
        let config = self.config.clone();
        let slot = self.slot.clone();
        let handle = std::thread::spawn(move || run_capture(config, slot, opened_tx));

        let format = match opened_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(result) => result?,
            Err(_) => {
                self.slot.close();
                return Err(anyhow!("timed out opening {}", self.config.device));
            }
        };
        self.capture = Some(handle);

        log::info!(
            "V4l2Source: connected to {} ({}x{}, {:?})",
            self.config.device,
            format.width,
            format.height,
            format.pixel_format
        );
        Ok(())
    }

    pub fn frames_captured(&self) -> u64 {
        self.slot.frames()
    }
}

impl VideoSource for V4l2Source {
    fn name(&self) -> &str {
        &self.config.device
    }

    fn is_ready(&self) -> bool {
        self.capture.is_some() && !self.slot.is_closed() && self.slot.has_frame()
    }

    fn capture_size(&self) -> (u32, u32) {
        self.slot.size()
    }

    fn snapshot(&mut self) -> Result<Option<RgbImage>> {
        if let Some(error) = self.slot.last_error() {
            return Err(anyhow!("v4l2 capture failed: {}", error));
        }
        Ok(self.slot.latest())
    }

    fn release(&mut self) {
        let Some(handle) = self.capture.take() else {
            return;
        };
        self.slot.close();
        if handle.join().is_err() {
            log::warn!("V4l2Source: capture thread for {} panicked", self.config.device);
        }
        log::info!("V4l2Source: released {}", self.config.device);
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_device(config: &CameraConfig) -> Result<(v4l::Device, ActiveFormat)> {
    use v4l::video::Capture;

    let device = v4l::Device::with_path(&config.device)
        .with_context(|| format!("open v4l2 device {}", config.device))?;
    let mut format = device.format().context("read v4l2 format")?;
    format.width = config.width;
    format.height = config.height;
    format.fourcc = v4l::FourCC::new(b"MJPG");

    let format = match device.set_format(&format) {
        Ok(format) => format,
        Err(err) => {
            log::warn!(
                "V4l2Source: failed to set format on {}: {}",
                config.device,
                err
            );
            device
                .format()
                .context("read v4l2 format after set failure")?
        }
    };

    if config.target_fps > 0 {
        let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
        if let Err(err) = device.set_params(&params) {
            log::warn!(
                "V4l2Source: failed to set fps on {}: {}",
                config.device,
                err
            );
        }
    }

    let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
        anyhow!(
            "unsupported v4l2 pixel format {} on {}",
            format.fourcc,
            config.device
        )
    })?;
    Ok((
        device,
        ActiveFormat {
            width: format.width,
            height: format.height,
            pixel_format,
        },
    ))
}

fn run_capture(
    config: CameraConfig,
    slot: FrameSlot<RgbImage>,
    opened: mpsc::Sender<Result<ActiveFormat>>,
) {
    use v4l::buffer::Type;
    use v4l::io::traits::CaptureStream;

    let (mut device, format) = match open_device(&config) {
        Ok(opened_device) => opened_device,
        Err(err) => {
            let _ = opened.send(Err(err));
            return;
        }
    };
    let mut stream =
        match v4l::prelude::MmapStream::with_buffers(&mut device, Type::VideoCapture, STREAM_BUFFERS)
        {
            Ok(stream) => stream,
            Err(err) => {
                let _ = opened.send(Err(anyhow::Error::new(err).context("create v4l2 buffer stream")));
                return;
            }
        };
    if opened.send(Ok(format)).is_err() {
        // connect() gave up waiting.
        return;
    }

    while !slot.is_closed() {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(err) => {
                let err = anyhow::Error::new(err).context("capture v4l2 frame");
                log::warn!("V4l2Source: {}: {:#}", config.device, err);
                slot.fail(err.to_string());
                break;
            }
        };
        let used = (meta.bytesused as usize).min(buf.len());
        let bytes = if used == 0 { buf } else { &buf[..used] };
        match normalize_to_rgb(bytes, format.width, format.height, format.pixel_format) {
            Ok(picture) => {
                let (width, height) = picture.dimensions();
                slot.publish(picture, width, height);
            }
            // A torn buffer only costs one picture.
            Err(err) => log::debug!("V4l2Source: dropped frame from {}: {:#}", config.device, err),
        }
    }
    log::debug!("V4l2Source: capture thread for {} exited", config.device);
}
