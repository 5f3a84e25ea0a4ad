//! live_detect - headless live detection loop
//!
//! This binary:
//! 1. Acquires the configured camera
//! 2. Starts the detection loop once the camera has buffered a frame
//! 3. Shows the live detection rate and detected objects
//! 4. Stops on Ctrl-C, after `--seconds`, or when the session expires
//! 5. Optionally writes the final overlay (and the overlay on the last frame) as PNG

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use live_detect::config::LiveDetectConfig;
use live_detect::overlay::composite;
use live_detect::ui;
use live_detect::{
    ConfiguredCamera, DetectionLoopController, HttpDetectionService, LoopError, LoopParts,
    LoopState, Notification, RasterCanvas, Session, Viewport,
};

/// How long to keep retrying `start_detection` while the camera warms up.
const WARMUP_LIMIT: Duration = Duration::from_secs(10);
const POLL_EVERY: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(
    name = "live_detect",
    about = "Run live object detection over a camera stream"
)]
struct Args {
    /// Stop after this many seconds (default: run until Ctrl-C).
    #[arg(long)]
    seconds: Option<u64>,

    /// Confidence threshold override (0.1 - 0.9).
    #[arg(long)]
    confidence: Option<f32>,

    /// IoU threshold override (0.1 - 0.9).
    #[arg(long)]
    iou: Option<f32>,

    /// Write the final overlay to this PNG file.
    #[arg(long)]
    overlay_out: Option<PathBuf>,

    /// Write the final overlay drawn over the last camera frame to this PNG file.
    #[arg(long)]
    composite_out: Option<PathBuf>,

    /// UI mode: auto, plain, pretty.
    #[arg(long, default_value = "auto")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = ui::Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());
    let cfg = LiveDetectConfig::load()?;

    let session = Arc::new(cfg.session()?);
    if let Some(user) = session.user() {
        log::info!("signed in as {}", user);
    }
    let service = Arc::new(HttpDetectionService::new(&cfg.service)?);
    log::info!("detection service: {}", service.url());

    let mut canvas = RasterCanvas::new(cfg.display.width, cfg.display.height);
    if let Some(path) = &cfg.overlay.font_path {
        canvas = canvas.with_font(RasterCanvas::load_font(path)?);
    }

    let (notify_tx, notify_rx) = mpsc::channel::<Notification>();
    let controller = DetectionLoopController::new(
        LoopParts {
            camera: Box::new(ConfiguredCamera::new(cfg.camera.clone())),
            service,
            session,
            canvas: Box::new(canvas),
            viewport: Viewport::new(cfg.display.width, cfg.display.height),
            notifier: Arc::new(notify_tx),
        },
        cfg.thresholds(),
        cfg.loop_options(),
    );
    if let Some(confidence) = args.confidence {
        log::info!("confidence = {:.2}", controller.set_confidence(confidence));
    }
    if let Some(iou) = args.iou {
        log::info!("iou = {:.2}", controller.set_iou(iou));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    {
        let _stage = ui.stage(&format!("starting webcam {}", cfg.camera.device));
        controller.start_webcam()?;
    }
    {
        let _stage = ui.stage("starting detection");
        start_when_ready(&controller, &shutdown)?;
    }

    let status = ui.status();
    let deadline = args
        .seconds
        .map(|seconds| Instant::now() + Duration::from_secs(seconds));
    let mut expired = false;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            log::info!("shutdown signal received");
            break;
        }
        if deadline.is_some_and(|at| Instant::now() >= at) {
            break;
        }
        expired |= report_notifications(&notify_rx, &status);
        if expired || controller.state() != LoopState::Detecting {
            break;
        }
        status.update(format_status(&controller));
        std::thread::sleep(POLL_EVERY);
    }
    // The loop may have stopped between the drain above and the state check.
    expired |= report_notifications(&notify_rx, &status);

    write_outputs(&controller, &args)?;
    controller.teardown();
    status.finish(format!("stopped ({})", controller.state().as_str()));

    if expired {
        return Err(anyhow!("session expired; login again"));
    }
    Ok(())
}

/// Print queued notifications. Returns true if the session expired.
fn report_notifications(rx: &mpsc::Receiver<Notification>, status: &ui::StatusLine) -> bool {
    let mut expired = false;
    for notification in rx.try_iter() {
        match notification {
            Notification::SessionExpired => {
                status.println("session expired; login again");
                expired = true;
            }
            Notification::CameraUnavailable(reason) => {
                status.println(&format!("camera unavailable: {}", reason))
            }
            other => log::debug!("notification: {:?}", other),
        }
    }
    expired
}

fn start_when_ready(controller: &DetectionLoopController, shutdown: &AtomicBool) -> Result<()> {
    let started = Instant::now();
    loop {
        match controller.start_detection() {
            Ok(()) => return Ok(()),
            Err(LoopError::NotReady) => {
                if shutdown.load(Ordering::SeqCst) {
                    return Err(anyhow!("interrupted while waiting for the camera"));
                }
                if started.elapsed() >= WARMUP_LIMIT {
                    return Err(anyhow!(
                        "camera produced no frame within {:?}",
                        WARMUP_LIMIT
                    ));
                }
                std::thread::sleep(POLL_EVERY);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn format_status(controller: &DetectionLoopController) -> String {
    let objects = controller
        .current_result()
        .map(|result| {
            result
                .boxes
                .iter()
                .map(|b| format!("{} {:.1}%", b.class_name, b.confidence * 100.0))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    format!(
        "{} fps | {} object(s){}{}",
        controller.fps(),
        objects.len(),
        if controller.is_processing() {
            " | processing"
        } else {
            ""
        },
        if objects.is_empty() {
            String::new()
        } else {
            format!(" | {}", objects.join(", "))
        }
    )
}

fn write_outputs(controller: &DetectionLoopController, args: &Args) -> Result<()> {
    if args.overlay_out.is_none() && args.composite_out.is_none() {
        return Ok(());
    }
    let Some(overlay) = controller.overlay_image() else {
        log::warn!("overlay canvas has no pixels to write");
        return Ok(());
    };
    if let Some(path) = &args.overlay_out {
        overlay
            .save(path)
            .with_context(|| format!("write overlay {}", path.display()))?;
        log::info!("overlay written to {}", path.display());
    }
    if let Some(path) = &args.composite_out {
        match controller.preview()? {
            Some(frame) => {
                composite(&frame, &overlay)
                    .save(path)
                    .with_context(|| format!("write composite {}", path.display()))?;
                log::info!("composite written to {}", path.display());
            }
            None => log::warn!("no camera frame available for {}", path.display()),
        }
    }
    Ok(())
}
