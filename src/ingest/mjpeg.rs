//! HTTP camera source.
//!
//! This module provides `MjpegSource` for IP webcams that serve either a
//! `multipart/x-mixed-replace` MJPEG stream or a single-JPEG snapshot URL.
//!
//! MJPEG streams are drained by a background reader that keeps only the most
//! recent JPEG. Snapshot URLs are polled by a background fetcher at the
//! camera's target frame rate. Either way `snapshot()` never touches the
//! network; it decodes the latest buffered JPEG.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::io::Read;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::slot::FrameSlot;
use super::CameraConfig;
use crate::frame::VideoSource;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// A camera that has not delivered a picture for this long is not ready.
const STALE_AFTER: Duration = Duration::from_secs(2);
/// Snapshot polling pause after a failed fetch.
const RETRY_AFTER: Duration = Duration::from_secs(1);

/// HTTP MJPEG/JPEG camera.
pub struct MjpegSource {
    config: CameraConfig,
    agent: ureq::Agent,
    mode: Option<HttpMode>,
    slot: FrameSlot<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
}

enum HttpMode {
    Stream,
    Snapshot,
}

impl MjpegSource {
    pub fn new(config: CameraConfig) -> Result<Self> {
        let url = url::Url::parse(&config.device).context("parse camera url")?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported camera scheme '{}'; expected http(s)",
                url.scheme()
            ));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Ok(Self {
            config,
            agent,
            mode: None,
            slot: FrameSlot::new(),
            reader: None,
        })
    }

    /// Connect to the camera and buffer its first picture.
    pub fn connect(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.config.device)
            .call()
            .with_context(|| format!("connect to camera {}", self.config.device))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_string();

        if content_type.to_lowercase().contains("multipart") {
            let boundary = content_type_boundary(&content_type);
            let mut stream = MjpegStream::new(response.into_reader(), boundary.as_deref());
            let first = stream.read_next_jpeg()?;
            let (width, height) = jpeg_size(&first)?;
            self.slot.publish(first, width, height);

            let slot = self.slot.clone();
            let device = self.config.device.clone();
            self.reader = Some(std::thread::spawn(move || {
                run_reader(stream, slot, device);
            }));
            self.mode = Some(HttpMode::Stream);
        } else {
            let bytes = read_jpeg_body(response)?;
            let (width, height) = jpeg_size(&bytes)?;
            self.slot.publish(bytes, width, height);

            let poller = SnapshotPoller {
                agent: self.agent.clone(),
                device: self.config.device.clone(),
                every: Duration::from_millis(1000 / u64::from(self.config.target_fps.max(1))),
            };
            let slot = self.slot.clone();
            self.reader = Some(std::thread::spawn(move || poller.run(slot)));
            self.mode = Some(HttpMode::Snapshot);
        }

        let (width, height) = self.slot.size();
        log::info!(
            "MjpegSource: connected to {} ({}x{})",
            self.config.device,
            width,
            height
        );
        Ok(())
    }

    pub fn frames_captured(&self) -> u64 {
        self.slot.frames()
    }

}

impl VideoSource for MjpegSource {
    fn name(&self) -> &str {
        &self.config.device
    }

    fn is_ready(&self) -> bool {
        if self.mode.is_none() || self.slot.is_closed() || !self.slot.has_frame() {
            return false;
        }
        self.slot
            .idle_for()
            .map(|idle| idle <= STALE_AFTER)
            .unwrap_or(false)
    }

    fn capture_size(&self) -> (u32, u32) {
        self.slot.size()
    }

    fn snapshot(&mut self) -> Result<Option<RgbImage>> {
        match self.mode {
            None => return Ok(None),
            // A snapshot fetch failure is retried by the poller; staleness
            // shows up through `is_ready`.
            Some(HttpMode::Snapshot) => {}
            Some(HttpMode::Stream) => {
                if let Some(error) = self.slot.last_error() {
                    return Err(anyhow!("camera stream failed: {}", error));
                }
            }
        }
        let Some(jpeg) = self.slot.latest() else {
            return Ok(None);
        };
        let picture = image::load_from_memory(&jpeg).context("decode jpeg")?;
        Ok(Some(picture.into_rgb8()))
    }

    fn release(&mut self) {
        if self.mode.take().is_none() {
            return;
        }
        self.slot.close();
        // The reader exits on its next chunk, fetch or read timeout.
        self.reader.take();
        log::info!("MjpegSource: released {}", self.config.device);
    }
}

impl Drop for MjpegSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn run_reader(mut stream: MjpegStream, slot: FrameSlot<Vec<u8>>, device: String) {
    while !slot.is_closed() {
        match stream.read_next_jpeg().and_then(|jpeg| {
            let (width, height) = jpeg_size(&jpeg)?;
            Ok((jpeg, width, height))
        }) {
            Ok((jpeg, width, height)) => {
                if slot.is_closed() {
                    break;
                }
                slot.publish(jpeg, width, height);
            }
            Err(err) => {
                log::warn!("MjpegSource: stream {} stopped: {:#}", device, err);
                slot.fail(err.to_string());
                break;
            }
        }
    }
    log::debug!("MjpegSource: reader for {} exited", device);
}

struct SnapshotPoller {
    agent: ureq::Agent,
    device: String,
    every: Duration,
}

impl SnapshotPoller {
    fn run(self, slot: FrameSlot<Vec<u8>>) {
        while !slot.is_closed() {
            let started = Instant::now();
            let pause = match self.fetch() {
                Ok((jpeg, width, height)) => {
                    if slot.is_closed() {
                        break;
                    }
                    slot.publish(jpeg, width, height);
                    self.every
                }
                Err(err) => {
                    log::warn!("MjpegSource: snapshot from {} failed: {:#}", self.device, err);
                    slot.fail(err.to_string());
                    RETRY_AFTER
                }
            };
            if let Some(rest) = pause.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        log::debug!("MjpegSource: poller for {} exited", self.device);
    }

    fn fetch(&self) -> Result<(Vec<u8>, u32, u32)> {
        let response = self
            .agent
            .get(&self.device)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.device))?;
        let jpeg = read_jpeg_body(response)?;
        let (width, height) = jpeg_size(&jpeg)?;
        Ok((jpeg, width, height))
    }
}

fn read_jpeg_body(response: ureq::Response) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
    delimiter: Vec<u8>,
}

impl MjpegStream {
    /// `boundary` is the `boundary=` parameter of the response content type.
    fn new(reader: Box<dyn Read + Send>, boundary: Option<&str>) -> Self {
        let delimiter = match boundary {
            Some(boundary) => format!("--{}", boundary.trim_start_matches('-')),
            None => "\r\n--".to_string(),
        };
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
            delimiter: delimiter.into_bytes(),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer, &self.delimiter) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn content_type_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn jpeg_size(bytes: &[u8]) -> Result<(u32, u32)> {
    let reader = image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .context("sniff jpeg format")?;
    reader.into_dimensions().context("read jpeg dimensions")
}

/// Locate the next complete JPEG in `buffer`.
///
/// The part's `Content-Length` decides where the picture ends. Without one,
/// the picture runs to the last EOI before the next `delimiter`, so EOI
/// markers of embedded thumbnails do not cut it short.
fn find_jpeg_bounds(buffer: &[u8], delimiter: &[u8]) -> Option<(usize, usize)> {
    let start = find(buffer, &[0xFF, 0xD8])?;
    if let Some(length) = part_content_length(&buffer[..start]) {
        let end = start + length;
        return (buffer.len() >= end).then_some((start, end));
    }
    let body = start + 2;
    let next_part = body + find(&buffer[body..], delimiter)?;
    let eoi = buffer[body..next_part]
        .windows(2)
        .rposition(|w| w == [0xFF, 0xD9])?;
    Some((start, body + eoi + 2))
}

/// `Content-Length` of the part whose headers end at the picture start.
fn part_content_length(preamble: &[u8]) -> Option<usize> {
    let headers = String::from_utf8_lossy(preamble);
    headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(key, _)| key.trim().eq_ignore_ascii_case("content-length"))
        .filter_map(|(_, value)| value.trim().parse::<usize>().ok())
        .last()
        .filter(|length| (4..=MAX_JPEG_BYTES).contains(length))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
