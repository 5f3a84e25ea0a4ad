//! Detection loop controller.
//!
//! `DetectionLoopController` owns the live camera source, the periodic
//! scheduler and the overlay canvas, and moves between three states:
//!
//! ```text
//!   Idle --start_webcam--> Streaming --start_detection--> Detecting
//!     ^                     |    ^                           |
//!     +-----stop_webcam-----+    +------stop_detection-------+
//!                                     (or session expiry)
//! ```
//!
//! Each tick while Detecting captures a frame, sends it to the Detection
//! Service with the thresholds current at send time, and redraws the overlay
//! from the response. The controller lock is never held across frame capture
//! or the network round trip; every cycle carries the epoch it was started in
//! and drops its result if the loop was stopped or restarted meanwhile.
//!
//! At most one request is out at the service per controller. A loop that is
//! restarted while the previous loop's request is still pending skips its
//! ticks until that request returns.

use anyhow::{Context, Result};
use image::{RgbImage, RgbaImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::detect::{DetectionCycleResult, DetectionService, Session, Thresholds};
use crate::error::{LoopError, RequestError};
use crate::frame::{FrameCapture, VideoSource, DEFAULT_JPEG_QUALITY};
use crate::ingest::CameraDevice;
use crate::overlay::{Canvas, CoordinateMapper, OverlayRenderer, OverlayStyle, Viewport};
use crate::rate::RateMonitor;
use crate::scheduler::{SchedulerStats, SingleFlightScheduler, DEFAULT_TICK_INTERVAL};

// ----------------------------------------------------------------------------
// Public types
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// No camera acquired.
    Idle,
    /// Camera streaming, no detection running.
    Streaming,
    /// Camera streaming and the detection loop ticking.
    Detecting,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Streaming => "streaming",
            LoopState::Detecting => "detecting",
        }
    }
}

/// User-facing events raised by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    WebcamStarted,
    WebcamStopped,
    DetectionStarted,
    DetectionStopped,
    /// The Detection Service rejected the session; the user must log in again.
    SessionExpired,
    CameraUnavailable(String),
}

/// Receives controller notifications.
///
/// `SessionExpired` is raised from the detection thread before the state
/// change it reports is visible, with the controller lock held. Other
/// notifications are raised without any lock. Implementations must not call
/// back into the controller.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

impl Notifier for mpsc::Sender<Notification> {
    fn notify(&self, notification: Notification) {
        if self.send(notification).is_err() {
            log::trace!("notification dropped: receiver gone");
        }
    }
}

/// Notifier that only writes to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::SessionExpired => log::warn!("session expired; login again"),
            Notification::CameraUnavailable(reason) => {
                log::warn!("camera unavailable: {}", reason)
            }
            other => log::info!("{:?}", other),
        }
    }
}

/// Loop tuning.
#[derive(Clone, Debug)]
pub struct LoopOptions {
    /// Detection tick period.
    pub interval: Duration,
    /// JPEG quality of frames sent to the service.
    pub jpeg_quality: u8,
    pub style: OverlayStyle,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_TICK_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            style: OverlayStyle::default(),
        }
    }
}

/// Collaborators the controller is built from.
pub struct LoopParts {
    pub camera: Box<dyn CameraDevice>,
    pub service: Arc<dyn DetectionService>,
    pub session: Arc<dyn Session>,
    pub canvas: Box<dyn Canvas>,
    pub viewport: Viewport,
    pub notifier: Arc<dyn Notifier>,
}

// ----------------------------------------------------------------------------
// Shared loop state
// ----------------------------------------------------------------------------

/// The live source, shared with cycles so capture can run outside the
/// controller lock.
type SharedSource = Arc<Mutex<Box<dyn VideoSource>>>;

fn lock_source(source: &SharedSource) -> MutexGuard<'_, Box<dyn VideoSource>> {
    source.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Camera and timer handles, released together.
#[derive(Default)]
struct Resources {
    source: Option<SharedSource>,
    scheduler: Option<SingleFlightScheduler>,
}

struct LoopShared {
    state: LoopState,
    /// Bumped on every transition out of Detecting and every new start, so an
    /// in-flight cycle can tell its loop is gone.
    epoch: u64,
    resources: Resources,
    camera: Box<dyn CameraDevice>,
    canvas: Box<dyn Canvas>,
    renderer: OverlayRenderer,
    capture: FrameCapture,
    result: Option<DetectionCycleResult>,
    rate: RateMonitor,
    processing: bool,
}

impl LoopShared {
    /// Blank the overlay and forget everything the last loop produced.
    fn reset_overlay(&mut self) {
        self.renderer.clear(self.canvas.as_mut());
        self.result = None;
        self.rate.reset();
        self.processing = false;
    }
}

fn lock_shared(shared: &Mutex<LoopShared>) -> MutexGuard<'_, LoopShared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// DetectionLoopController
// ----------------------------------------------------------------------------

/// Live detection loop over one camera.
///
/// All methods take `&self`; the controller can be shared across threads
/// (UI thread, signal handler) behind an `Arc`. Dropping it tears everything
/// down.
pub struct DetectionLoopController {
    shared: Arc<Mutex<LoopShared>>,
    /// Set while any cycle, current or stale, has a request out.
    outstanding: Arc<AtomicBool>,
    thresholds: Thresholds,
    service: Arc<dyn DetectionService>,
    session: Arc<dyn Session>,
    viewport: Viewport,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
}

impl DetectionLoopController {
    pub fn new(parts: LoopParts, thresholds: Thresholds, options: LoopOptions) -> Self {
        let shared = LoopShared {
            state: LoopState::Idle,
            epoch: 0,
            resources: Resources::default(),
            camera: parts.camera,
            canvas: parts.canvas,
            renderer: OverlayRenderer::new(options.style),
            capture: FrameCapture::new(options.jpeg_quality),
            result: None,
            rate: RateMonitor::new(),
            processing: false,
        };
        Self {
            shared: Arc::new(Mutex::new(shared)),
            outstanding: Arc::new(AtomicBool::new(false)),
            thresholds,
            service: parts.service,
            session: parts.session,
            viewport: parts.viewport,
            notifier: parts.notifier,
            interval: options.interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopShared> {
        lock_shared(&self.shared)
    }

    // ---- transitions

    /// Idle -> Streaming. Acquire the camera.
    ///
    /// A no-op when already streaming. Acquisition failure leaves the
    /// controller Idle and is reported as `LoopError::DeviceUnavailable`.
    pub fn start_webcam(&self) -> Result<(), LoopError> {
        let mut shared = self.lock();
        if shared.state != LoopState::Idle {
            log::debug!("start_webcam ignored: already {}", shared.state.as_str());
            return Ok(());
        }
        let device = shared.camera.describe();
        match shared.camera.acquire() {
            Ok(source) => {
                log::info!(
                    "webcam started: {} (capture size {:?})",
                    source.name(),
                    source.capture_size()
                );
                shared.resources.source = Some(Arc::new(Mutex::new(source)));
                shared.state = LoopState::Streaming;
                drop(shared);
                self.notifier.notify(Notification::WebcamStarted);
                Ok(())
            }
            Err(err) => {
                let reason = format!("{}: {:#}", device, err);
                drop(shared);
                log::warn!("camera unavailable: {}", reason);
                self.notifier
                    .notify(Notification::CameraUnavailable(reason.clone()));
                Err(LoopError::DeviceUnavailable(reason))
            }
        }
    }

    /// Streaming -> Detecting. Start the periodic detection loop.
    ///
    /// The source must already be ready; `NotReady` asks the caller to retry
    /// shortly and nothing is retried internally.
    pub fn start_detection(&self) -> Result<(), LoopError> {
        let mut shared = self.lock();
        match shared.state {
            LoopState::Idle => return Err(LoopError::NotStreaming),
            LoopState::Detecting => return Err(LoopError::AlreadyDetecting),
            LoopState::Streaming => {}
        }
        if !self.session.is_authenticated() {
            return Err(LoopError::NotAuthenticated);
        }
        let ready = shared
            .resources
            .source
            .as_ref()
            .map(|source| lock_source(source).is_ready())
            .unwrap_or(false);
        if !ready {
            return Err(LoopError::NotReady);
        }

        shared.epoch += 1;
        let cycle = CycleContext {
            epoch: shared.epoch,
            shared: self.shared.clone(),
            outstanding: self.outstanding.clone(),
            thresholds: self.thresholds.clone(),
            service: self.service.clone(),
            session: self.session.clone(),
            viewport: self.viewport.clone(),
            notifier: self.notifier.clone(),
        };
        let scheduler = SingleFlightScheduler::start(self.interval, move || cycle.run())
            .map_err(|err| LoopError::Scheduler(format!("{:#}", err)))?;
        shared.resources.scheduler = Some(scheduler);
        shared.state = LoopState::Detecting;
        drop(shared);

        log::info!(
            "detection started: service={} interval={:?}",
            self.service.name(),
            self.interval
        );
        self.notifier.notify(Notification::DetectionStarted);
        Ok(())
    }

    /// Detecting -> Streaming. A no-op in any other state.
    ///
    /// Returns without waiting for an in-flight request; its response is
    /// discarded when it arrives. A loop started again before then sends
    /// nothing until it has.
    pub fn stop_detection(&self) {
        let mut shared = self.lock();
        if shared.state != LoopState::Detecting {
            return;
        }
        shared.state = LoopState::Streaming;
        shared.epoch += 1;
        let scheduler = shared.resources.scheduler.take();
        shared.reset_overlay();
        drop(shared);

        if let Some(mut scheduler) = scheduler {
            scheduler.stop();
        }
        log::info!("detection stopped");
        self.notifier.notify(Notification::DetectionStopped);
    }

    /// Streaming/Detecting -> Idle. Stop detection and release the camera.
    pub fn stop_webcam(&self) {
        let mut shared = self.lock();
        if shared.state == LoopState::Idle {
            return;
        }
        let was_detecting = shared.state == LoopState::Detecting;
        shared.state = LoopState::Idle;
        shared.epoch += 1;
        let resources = std::mem::take(&mut shared.resources);
        shared.reset_overlay();
        drop(shared);

        release(resources);
        log::info!("webcam stopped");
        if was_detecting {
            self.notifier.notify(Notification::DetectionStopped);
        }
        self.notifier.notify(Notification::WebcamStopped);
    }

    /// Release the scheduler and camera, whatever the current state.
    pub fn teardown(&self) {
        self.stop_webcam();
    }

    // ---- observation

    pub fn state(&self) -> LoopState {
        self.lock().state
    }

    /// Detection rate of the most recent cycle.
    pub fn fps(&self) -> u32 {
        self.lock().rate.fps()
    }

    /// Boxes and timing of the most recent successful cycle.
    pub fn current_result(&self) -> Option<DetectionCycleResult> {
        self.lock().result.clone()
    }

    /// True while a frame is out at the Detection Service.
    pub fn is_processing(&self) -> bool {
        self.lock().processing
    }

    pub fn scheduler_stats(&self) -> Option<SchedulerStats> {
        self.lock()
            .resources
            .scheduler
            .as_ref()
            .map(|scheduler| scheduler.stats())
    }

    /// Current overlay pixels, when the canvas is pixel backed.
    pub fn overlay_image(&self) -> Option<RgbaImage> {
        self.lock().canvas.to_image()
    }

    /// Current camera picture at capture resolution.
    pub fn preview(&self) -> Result<Option<RgbImage>, LoopError> {
        let Some(source) = self.lock().resources.source.clone() else {
            return Ok(None);
        };
        let picture = lock_source(&source).snapshot();
        picture.map_err(|err| LoopError::Capture(format!("{:#}", err)))
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    // ---- thresholds

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Takes effect from the next request sent. Returns the clamped value.
    pub fn set_confidence(&self, confidence: f32) -> f32 {
        self.thresholds.set_confidence(confidence)
    }

    /// Takes effect from the next request sent. Returns the clamped value.
    pub fn set_iou(&self, iou: f32) -> f32 {
        self.thresholds.set_iou(iou)
    }
}

impl Drop for DetectionLoopController {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn release(resources: Resources) {
    let Resources { source, scheduler } = resources;
    if let Some(mut scheduler) = scheduler {
        scheduler.stop();
    }
    if let Some(source) = source {
        let mut source = lock_source(&source);
        log::debug!("releasing {}", source.name());
        source.release();
    }
}

/// Marks the controller's request slot taken; frees it when dropped.
struct OutstandingRequest(Arc<AtomicBool>);

impl OutstandingRequest {
    fn claim(flag: &Arc<AtomicBool>) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Self(flag.clone()))
    }
}

impl Drop for OutstandingRequest {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// One detection cycle
// ----------------------------------------------------------------------------

/// Everything a tick needs, captured when the loop starts.
struct CycleContext {
    epoch: u64,
    shared: Arc<Mutex<LoopShared>>,
    outstanding: Arc<AtomicBool>,
    thresholds: Thresholds,
    service: Arc<dyn DetectionService>,
    session: Arc<dyn Session>,
    viewport: Viewport,
    notifier: Arc<dyn Notifier>,
}

impl CycleContext {
    fn is_current(&self, shared: &LoopShared) -> bool {
        shared.epoch == self.epoch && shared.state == LoopState::Detecting
    }

    fn run(&self) -> Result<()> {
        let started = Instant::now();

        // claim the request slot and take the source handle
        let (capture, source, _request) = {
            let shared = lock_shared(&self.shared);
            if !self.is_current(&shared) {
                return Ok(());
            }
            let Some(source) = shared.resources.source.clone() else {
                return Ok(());
            };
            let Some(request) = OutstandingRequest::claim(&self.outstanding) else {
                log::trace!("cycle skipped: previous request still out");
                return Ok(());
            };
            (shared.capture, source, request)
        };

        // capture and encode without the controller lock
        let frame = {
            let mut camera = lock_source(&source);
            capture.capture(&mut **camera)?
        };
        let Some(frame) = frame else {
            log::trace!("cycle skipped: no frame");
            return Ok(());
        };
        {
            let mut shared = lock_shared(&self.shared);
            if !self.is_current(&shared) {
                return Ok(());
            }
            shared.processing = true;
        }

        // round trip without the lock
        let config = self.thresholds.snapshot();
        let token = self.session.bearer_token();
        let outcome = self.service.detect(&frame, config, token.as_deref());

        let mut shared = lock_shared(&self.shared);
        if !self.is_current(&shared) {
            log::debug!("discarding response for a stopped detection loop");
            return Ok(());
        }
        shared.processing = false;

        let boxes = match outcome {
            Ok(boxes) => boxes,
            Err(RequestError::AuthExpired) => {
                self.expire(shared);
                return Ok(());
            }
            Err(err) => {
                return Err(err).context("detection cycle abandoned; overlay kept");
            }
        };

        let capture_size = (frame.width, frame.height);
        let display_size = self.viewport.size();
        let mapped = CoordinateMapper::new(capture_size, display_size).map_all(&boxes);
        {
            let LoopShared {
                renderer, canvas, ..
            } = &mut *shared;
            renderer.render(canvas.as_mut(), display_size, &mapped);
        }
        let duration = started.elapsed();
        let fps = shared.rate.record(duration);
        log::debug!(
            "cycle: {} object(s) in {:?} ({} fps, conf={:.2} iou={:.2})",
            boxes.len(),
            duration,
            fps,
            config.confidence,
            config.iou
        );
        shared.result = Some(DetectionCycleResult {
            boxes,
            capture_size,
            duration,
        });
        Ok(())
    }

    /// Stop the loop after the service rejected the session.
    ///
    /// The session is invalidated and the user notified before the lock is
    /// released, so nobody sees the loop stopped without the reason.
    fn expire(&self, mut shared: MutexGuard<'_, LoopShared>) {
        shared.state = LoopState::Streaming;
        shared.epoch += 1;
        let scheduler = shared.resources.scheduler.take();
        shared.reset_overlay();
        self.session.invalidate();
        self.notifier.notify(Notification::SessionExpired);
        drop(shared);

        // Running on the scheduler's own thread: this detaches instead of joining.
        if let Some(mut scheduler) = scheduler {
            scheduler.stop();
        }
        log::warn!("detection stopped: session expired");
    }
}
