//! Frame acquisition.
//!
//! - `VideoSource`: a live camera stream owned by the detection loop.
//! - `Frame`: one captured still, JPEG-encoded at native capture resolution.
//! - `FrameCapture`: turns the source's current picture into a `Frame`.
//!
//! Frames live for a single detection cycle. They are never written to disk
//! and their bytes are never logged.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::time::{Instant, SystemTime};

/// JPEG quality used for frames shipped to the Detection Service.
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// MIME type of every encoded frame payload.
pub const FRAME_CONTENT_TYPE: &str = "image/jpeg";

// ----------------------------------------------------------------------------
// VideoSource: live camera stream
// ----------------------------------------------------------------------------

/// A live camera stream.
///
/// Sources are acquired by a `CameraDevice` when the webcam starts and are
/// released exactly once when it stops (or when the controller is torn down).
pub trait VideoSource: Send {
    /// Human readable identifier (device path, URL).
    fn name(&self) -> &str;

    /// True once enough media is buffered to read a full picture.
    fn is_ready(&self) -> bool;

    /// Native capture resolution. May be `(0, 0)` before the first frame.
    fn capture_size(&self) -> (u32, u32);

    /// Current picture at native resolution, or `None` if nothing is buffered.
    fn snapshot(&mut self) -> Result<Option<RgbImage>>;

    /// Stop all underlying media tracks. Must be idempotent.
    fn release(&mut self);
}

// ----------------------------------------------------------------------------
// Frame: one encoded still
// ----------------------------------------------------------------------------

/// One captured still, encoded for transport.
#[derive(Clone, Debug)]
pub struct Frame {
    payload: Vec<u8>,
    /// Capture-space width.
    pub width: u32,
    /// Capture-space height.
    pub height: u32,
    /// Wall-clock capture time.
    pub captured_at: SystemTime,
    /// Monotonic capture instant, used for cycle timing.
    pub(crate) captured_instant: Instant,
}

impl Frame {
    pub fn new(payload: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            payload,
            width,
            height,
            captured_at: SystemTime::now(),
            captured_instant: Instant::now(),
        }
    }

    /// Encoded image bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn content_type(&self) -> &'static str {
        FRAME_CONTENT_TYPE
    }

    /// Time since capture.
    pub fn age(&self) -> std::time::Duration {
        self.captured_instant.elapsed()
    }
}

// ----------------------------------------------------------------------------
// FrameCapture
// ----------------------------------------------------------------------------

/// Captures the current picture of a source and JPEG-encodes it.
#[derive(Clone, Copy, Debug)]
pub struct FrameCapture {
    quality: u8,
}

impl FrameCapture {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Capture a frame from `source`.
    ///
    /// Returns `Ok(None)` when the source is not ready or produced an empty
    /// picture. Both are expected while a camera warms up and are not failures.
    pub fn capture(&self, source: &mut dyn VideoSource) -> Result<Option<Frame>> {
        if !source.is_ready() {
            log::trace!("FrameCapture: {} not ready", source.name());
            return Ok(None);
        }
        let Some(picture) = source
            .snapshot()
            .with_context(|| format!("snapshot {}", source.name()))?
        else {
            return Ok(None);
        };
        let (width, height) = picture.dimensions();
        if width == 0 || height == 0 {
            return Ok(None);
        }

        let payload = self.encode(&picture)?;
        if payload.is_empty() {
            log::trace!("FrameCapture: encoder produced no payload");
            return Ok(None);
        }
        Ok(Some(Frame::new(payload, width, height)))
    }

    fn encode(&self, picture: &RgbImage) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(picture.as_raw().len() / 8);
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut payload, self.quality);
            encoder.encode_image(picture).context("encode jpeg frame")?;
        }
        Ok(payload)
    }
}

impl Default for FrameCapture {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
