//! Lifecycle tests for the detection loop controller.
//!
//! These tests verify that:
//! 1. Camera acquisition failures keep the controller idle
//! 2. Detection refuses to start until the source is ready
//! 3. A zero-object cycle leaves a cleared overlay
//! 4. Threshold edits reach the very next request
//! 5. Session expiry stops the loop with exactly one notification, raised
//!    before the stopped state is observable
//! 6. Responses that arrive after stop (or restart) are discarded
//! 7. A restart never puts a second request out next to a stale one
//! 8. Slow frame capture does not block state queries or stop
//! 9. Dropping the controller releases the camera

use anyhow::{anyhow, Result};
use image::{Rgba, RgbImage};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use live_detect::{
    BoundingBox, CameraDevice, Canvas, DetectionConfig, DetectionLoopController,
    DetectionService, Frame, LoopError, LoopOptions, LoopParts, LoopState, Notification, Region,
    RequestError, Session, Thresholds, TokenSession, VideoSource, Viewport,
};

const CAPTURE: (u32, u32) = (128, 72);
const DISPLAY: (u32, u32) = (64, 36);

// ---- fakes

#[derive(Clone, Default)]
struct SourceFlags {
    ready: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
    snapshot_delay_ms: Arc<AtomicU64>,
    snapshotting: Arc<AtomicBool>,
}

struct FakeSource {
    flags: SourceFlags,
}

impl VideoSource for FakeSource {
    fn name(&self) -> &str {
        "fake://camera"
    }

    fn is_ready(&self) -> bool {
        self.flags.ready.load(Ordering::SeqCst)
    }

    fn capture_size(&self) -> (u32, u32) {
        CAPTURE
    }

    fn snapshot(&mut self) -> Result<Option<RgbImage>> {
        self.flags.snapshotting.store(true, Ordering::SeqCst);
        let delay = self.flags.snapshot_delay_ms.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(delay));
        self.flags.snapshotting.store(false, Ordering::SeqCst);
        Ok(Some(RgbImage::new(CAPTURE.0, CAPTURE.1)))
    }

    fn release(&mut self) {
        self.flags.released.store(true, Ordering::SeqCst);
    }
}

struct FakeCamera {
    fail: bool,
    flags: SourceFlags,
}

impl CameraDevice for FakeCamera {
    fn describe(&self) -> String {
        "fake://camera".to_string()
    }

    fn acquire(&mut self) -> Result<Box<dyn VideoSource>> {
        if self.fail {
            return Err(anyhow!("permission denied"));
        }
        Ok(Box::new(FakeSource {
            flags: self.flags.clone(),
        }))
    }
}

type Respond = dyn Fn(usize) -> Result<Vec<BoundingBox>, RequestError> + Send + Sync;

/// Service that answers from a script keyed by call index.
struct ScriptedService {
    respond: Box<Respond>,
    delay: Box<dyn Fn(usize) -> Duration + Send + Sync>,
    calls: Mutex<Vec<DetectionConfig>>,
    tokens: Mutex<Vec<Option<String>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedService {
    fn new(
        respond: impl Fn(usize) -> Result<Vec<BoundingBox>, RequestError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            delay: Box::new(|_| Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: impl Fn(usize) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Box::new(delay);
        self
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn configs(&self) -> Vec<DetectionConfig> {
        self.calls.lock().unwrap().clone()
    }
}

impl DetectionService for ScriptedService {
    fn name(&self) -> &str {
        "scripted"
    }

    fn detect(
        &self,
        frame: &Frame,
        config: DetectionConfig,
        bearer_token: Option<&str>,
    ) -> Result<Vec<BoundingBox>, RequestError> {
        assert_eq!((frame.width, frame.height), CAPTURE);
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(config);
            calls.len() - 1
        };
        self.tokens
            .lock()
            .unwrap()
            .push(bearer_token.map(str::to_string));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep((self.delay)(index));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        (self.respond)(index)
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Op {
    Resize(u32, u32),
    Clear,
    Stroke(Region),
    Fill(Region),
    Text(String),
}

struct RecordingCanvas {
    size: (u32, u32),
    ops: Arc<Mutex<Vec<Op>>>,
}

impl Canvas for RecordingCanvas {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.size = (width, height);
        self.ops.lock().unwrap().push(Op::Resize(width, height));
    }

    fn clear(&mut self) {
        self.ops.lock().unwrap().push(Op::Clear);
    }

    fn stroke_rect(&mut self, region: Region, _line_width: u32, _color: Rgba<u8>) {
        self.ops.lock().unwrap().push(Op::Stroke(region));
    }

    fn fill_rect(&mut self, region: Region, _color: Rgba<u8>) {
        self.ops.lock().unwrap().push(Op::Fill(region));
    }

    fn fill_text(&mut self, text: &str, _x: f32, _y: f32, _font_px: f32, _color: Rgba<u8>) {
        self.ops.lock().unwrap().push(Op::Text(text.to_string()));
    }

    fn measure_text(&self, text: &str, font_px: f32) -> f32 {
        text.len() as f32 * font_px * 0.5
    }
}

// ---- harness

struct Harness {
    controller: DetectionLoopController,
    service: Arc<ScriptedService>,
    session: Arc<TokenSession>,
    flags: SourceFlags,
    ops: Arc<Mutex<Vec<Op>>>,
    notifications: mpsc::Receiver<Notification>,
}

impl Harness {
    fn new(service: ScriptedService) -> Self {
        Self::build(service, false)
    }

    fn build(service: ScriptedService, camera_fails: bool) -> Self {
        let flags = SourceFlags::default();
        flags.ready.store(true, Ordering::SeqCst);
        let service = Arc::new(service);
        let session = Arc::new(TokenSession::new(Some("token-abc".to_string()), None));
        let ops = Arc::new(Mutex::new(Vec::new()));
        let (tx, notifications) = mpsc::channel::<Notification>();

        let controller = DetectionLoopController::new(
            LoopParts {
                camera: Box::new(FakeCamera {
                    fail: camera_fails,
                    flags: flags.clone(),
                }),
                service: service.clone(),
                session: session.clone(),
                canvas: Box::new(RecordingCanvas {
                    size: DISPLAY,
                    ops: ops.clone(),
                }),
                viewport: Viewport::new(DISPLAY.0, DISPLAY.1),
                notifier: Arc::new(tx),
            },
            Thresholds::default(),
            LoopOptions {
                interval: Duration::from_millis(20),
                ..LoopOptions::default()
            },
        );
        Self {
            controller,
            service,
            session,
            flags,
            ops,
            notifications,
        }
    }

    fn start(&self) {
        self.controller.start_webcam().expect("webcam");
        self.controller.start_detection().expect("detection");
    }

    fn ops_len(&self) -> usize {
        self.ops.lock().unwrap().len()
    }

    fn ops_since(&self, mark: usize) -> Vec<Op> {
        self.ops.lock().unwrap()[mark..].to_vec()
    }

    fn drain_notifications(&self) -> Vec<Notification> {
        self.notifications.try_iter().collect()
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn person() -> Vec<BoundingBox> {
    vec![BoundingBox::new("person", 0.9, [20.0, 20.0, 60.0, 60.0])]
}

// ---- tests

#[test]
fn camera_failure_keeps_controller_idle() {
    let harness = Harness::build(ScriptedService::new(|_| Ok(Vec::new())), true);

    let err = harness.controller.start_webcam().err().expect("must fail");
    assert!(matches!(err, LoopError::DeviceUnavailable(_)));
    assert!(err.to_string().contains("permission denied"));
    assert_eq!(harness.controller.state(), LoopState::Idle);

    let notes = harness.drain_notifications();
    assert!(matches!(notes.as_slice(), [Notification::CameraUnavailable(_)]));
}

#[test]
fn detection_waits_for_a_ready_source() {
    let harness = Harness::new(ScriptedService::new(|_| Ok(Vec::new())));
    harness.flags.ready.store(false, Ordering::SeqCst);
    harness.controller.start_webcam().expect("webcam");

    assert!(matches!(
        harness.controller.start_detection(),
        Err(LoopError::NotReady)
    ));
    assert_eq!(harness.controller.state(), LoopState::Streaming);

    harness.flags.ready.store(true, Ordering::SeqCst);
    harness.controller.start_detection().expect("ready now");
    assert_eq!(harness.controller.state(), LoopState::Detecting);
    assert!(matches!(
        harness.controller.start_detection(),
        Err(LoopError::AlreadyDetecting)
    ));
}

#[test]
fn successful_cycle_draws_mapped_boxes() {
    let harness = Harness::new(ScriptedService::new(|_| Ok(person())));
    harness.start();

    assert!(wait_until(Duration::from_secs(2), || harness
        .controller
        .current_result()
        .is_some()));
    let result = harness.controller.current_result().expect("result");
    assert_eq!(result.capture_size, CAPTURE);
    assert_eq!(result.boxes, person());

    let ops = harness.ops_since(0);
    assert!(ops.contains(&Op::Stroke(Region::new(10.0, 10.0, 20.0, 20.0))));
    assert!(ops.contains(&Op::Text("person 90%".to_string())));
    assert_eq!(
        harness.service.tokens.lock().unwrap()[0].as_deref(),
        Some("token-abc")
    );
}

#[test]
fn zero_object_cycle_clears_the_overlay() {
    let harness = Harness::new(ScriptedService::new(|call| {
        if call == 0 {
            Ok(person())
        } else {
            Ok(Vec::new())
        }
    }));
    harness.start();

    assert!(wait_until(Duration::from_secs(2), || {
        harness.service.call_count() >= 3
            && harness
                .controller
                .current_result()
                .map(|r| r.boxes.is_empty())
                .unwrap_or(false)
    }));
    harness.controller.stop_detection();

    let ops = harness.ops_since(0);
    let last_stroke = ops
        .iter()
        .rposition(|op| matches!(op, Op::Stroke(_)))
        .expect("first cycle drew a box");
    let clears_after = ops[last_stroke..]
        .iter()
        .filter(|op| **op == Op::Clear)
        .count();
    assert!(clears_after >= 2, "ops: {:?}", ops);
}

#[test]
fn threshold_edit_applies_to_next_request() {
    let harness = Harness::new(ScriptedService::new(|_| Ok(Vec::new())));
    harness.start();

    assert!(wait_until(Duration::from_secs(2), || harness
        .service
        .call_count()
        >= 1));
    assert_eq!(harness.controller.set_confidence(0.6), 0.6);
    let edited_at = harness.service.call_count();

    assert!(wait_until(Duration::from_secs(2), || harness
        .service
        .call_count()
        > edited_at + 1));
    let configs = harness.service.configs();
    assert_eq!(configs[0].confidence, 0.25);
    assert!(configs[edited_at + 1..]
        .iter()
        .all(|config| config.confidence == 0.6 && config.iou == 0.45));
}

#[test]
fn session_expiry_stops_loop_with_one_notification() {
    let harness = Harness::new(ScriptedService::new(|_| Err(RequestError::AuthExpired)));
    harness.start();
    harness.drain_notifications();

    assert!(wait_until(Duration::from_secs(2), || harness.controller.state()
        == LoopState::Streaming));
    thread::sleep(Duration::from_millis(150));

    let expired = harness
        .drain_notifications()
        .into_iter()
        .filter(|n| *n == Notification::SessionExpired)
        .count();
    assert_eq!(expired, 1);
    assert_eq!(harness.service.call_count(), 1);
    assert!(!harness.session.is_authenticated());
    assert_eq!(harness.controller.fps(), 0);
    assert!(harness.controller.current_result().is_none());

    // the webcam keeps streaming; a fresh login is needed to detect again
    assert!(matches!(
        harness.controller.start_detection(),
        Err(LoopError::NotAuthenticated)
    ));
}

#[test]
fn session_expiry_is_reported_before_the_loop_reads_stopped() {
    let harness = Harness::new(ScriptedService::new(|_| Err(RequestError::AuthExpired)));
    harness.start();
    harness.drain_notifications();

    let deadline = Instant::now() + Duration::from_secs(2);
    while harness.controller.state() == LoopState::Detecting {
        assert!(Instant::now() < deadline, "loop never stopped");
        std::hint::spin_loop();
    }
    // no sleep: the notification must already be queued
    let notes = harness.drain_notifications();
    assert!(
        notes.contains(&Notification::SessionExpired),
        "notes: {:?}",
        notes
    );
}

#[test]
fn transient_failure_keeps_previous_overlay() {
    let harness = Harness::new(ScriptedService::new(|call| {
        if call == 0 {
            Ok(person())
        } else {
            Err(RequestError::Transport("connection refused".to_string()))
        }
    }));
    harness.start();

    assert!(wait_until(Duration::from_secs(2), || harness
        .service
        .call_count()
        >= 4));
    assert_eq!(harness.controller.state(), LoopState::Detecting);
    let result = harness.controller.current_result().expect("first result kept");
    assert_eq!(result.boxes, person());

    let ops = harness.ops_since(0);
    let clears = ops.iter().filter(|op| **op == Op::Clear).count();
    assert_eq!(clears, 1, "failed cycles must not touch the overlay");
    let stats = harness.controller.scheduler_stats().expect("running");
    assert!(stats.failures >= 1);
}

#[test]
fn stop_mid_flight_discards_the_response() {
    let service = ScriptedService::new(|_| Ok(person())).with_delay(|_| Duration::from_millis(150));
    let harness = Harness::new(service);
    harness.start();

    assert!(wait_until(Duration::from_secs(2), || harness
        .controller
        .is_processing()));
    harness.controller.stop_detection();
    assert_eq!(harness.controller.state(), LoopState::Streaming);
    assert!(!harness.controller.is_processing());
    let mark = harness.ops_len();

    thread::sleep(Duration::from_millis(300));
    assert_eq!(harness.service.call_count(), 1);
    assert!(harness.controller.current_result().is_none());
    assert_eq!(harness.controller.fps(), 0);
    assert!(harness.ops_since(mark).is_empty());
}

#[test]
fn restarted_loop_ignores_stale_response() {
    let service = ScriptedService::new(|call| {
        let class = if call == 0 { "stale" } else { "fresh" };
        Ok(vec![BoundingBox::new(class, 0.8, [0.0, 0.0, 10.0, 10.0])])
    })
    .with_delay(|call| {
        if call == 0 {
            Duration::from_millis(250)
        } else {
            Duration::ZERO
        }
    });
    let harness = Harness::new(service);
    harness.start();

    assert!(wait_until(Duration::from_secs(2), || harness
        .service
        .call_count()
        == 1));
    harness.controller.stop_detection();
    harness.controller.start_detection().expect("restart");

    assert!(wait_until(Duration::from_secs(2), || harness
        .controller
        .current_result()
        .is_some()));
    // let the stale request resolve
    thread::sleep(Duration::from_millis(350));
    let result = harness.controller.current_result().expect("result");
    assert_eq!(result.boxes[0].class_name, "fresh");
    assert!(!harness
        .ops_since(0)
        .contains(&Op::Text("stale 80%".to_string())));
}

#[test]
fn restart_never_overlaps_the_stale_request() {
    let service = ScriptedService::new(|_| Ok(person())).with_delay(|call| {
        if call == 0 {
            Duration::from_millis(300)
        } else {
            Duration::from_millis(50)
        }
    });
    let harness = Harness::new(service);
    harness.start();

    assert!(wait_until(Duration::from_secs(2), || harness
        .service
        .call_count()
        == 1));
    harness.controller.stop_detection();
    harness.controller.start_detection().expect("restart");
    assert_eq!(harness.controller.state(), LoopState::Detecting);

    assert!(wait_until(Duration::from_secs(3), || harness
        .service
        .call_count()
        >= 4));
    harness.controller.stop_detection();
    assert_eq!(harness.service.max_in_flight.load(Ordering::SeqCst), 1);
}

#[test]
fn slow_capture_does_not_block_observers() {
    let harness = Harness::new(ScriptedService::new(|_| Ok(person())));
    harness
        .flags
        .snapshot_delay_ms
        .store(400, Ordering::SeqCst);
    harness.start();

    assert!(wait_until(Duration::from_secs(2), || harness
        .flags
        .snapshotting
        .load(Ordering::SeqCst)));
    let started = Instant::now();
    assert_eq!(harness.controller.state(), LoopState::Detecting);
    assert_eq!(harness.controller.fps(), 0);
    assert!(!harness.controller.is_processing());
    harness.controller.stop_detection();
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "observers waited {:?} on capture",
        started.elapsed()
    );
    assert_eq!(harness.controller.state(), LoopState::Streaming);

    // the frame captured for the stopped loop is never sent
    thread::sleep(Duration::from_millis(500));
    assert_eq!(harness.service.call_count(), 0);
}

#[test]
fn cycles_never_overlap() {
    let service = ScriptedService::new(|_| Ok(Vec::new())).with_delay(|_| Duration::from_millis(60));
    let harness = Harness::new(service);
    harness.start();

    thread::sleep(Duration::from_millis(400));
    harness.controller.stop_detection();
    assert_eq!(harness.service.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(harness.service.call_count() >= 3);
}

#[test]
fn viewport_resize_reaches_the_canvas() {
    let harness = Harness::new(ScriptedService::new(|_| Ok(person())));
    harness.start();
    harness.controller.viewport().set_size(256, 144);

    assert!(wait_until(Duration::from_secs(2), || harness
        .ops_since(0)
        .contains(&Op::Resize(256, 144))));
    assert!(wait_until(Duration::from_secs(2), || harness
        .ops_since(0)
        .contains(&Op::Stroke(Region::new(40.0, 40.0, 80.0, 80.0)))));
}

#[test]
fn stop_webcam_releases_source_and_notifies() {
    let harness = Harness::new(ScriptedService::new(|_| Ok(Vec::new())));
    harness.start();
    harness.controller.stop_webcam();

    assert_eq!(harness.controller.state(), LoopState::Idle);
    assert!(harness.flags.released.load(Ordering::SeqCst));
    let notes = harness.drain_notifications();
    assert_eq!(
        notes,
        vec![
            Notification::WebcamStarted,
            Notification::DetectionStarted,
            Notification::DetectionStopped,
            Notification::WebcamStopped,
        ]
    );
}

#[test]
fn dropping_controller_releases_everything() {
    let harness = Harness::new(ScriptedService::new(|_| Ok(Vec::new())));
    harness.start();
    assert!(wait_until(Duration::from_secs(2), || harness
        .service
        .call_count()
        >= 1));

    let Harness {
        controller,
        service,
        flags,
        ..
    } = harness;
    drop(controller);
    assert!(flags.released.load(Ordering::SeqCst));

    thread::sleep(Duration::from_millis(50));
    let calls = service.call_count();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(service.call_count(), calls);
}
