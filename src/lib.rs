//! Live webcam object detection.
//!
//! This crate runs a periodic detection loop over a live camera: it captures
//! frames, ships them to a remote Detection Service, and draws the returned
//! boxes as an overlay scaled to the display.
//!
//! # Guarantees
//!
//! 1. **Single flight**: at most one detection request is outstanding per loop;
//!    ticks that fall due while a request is in flight are skipped.
//! 2. **Last writer wins**: a new result replaces the previous one entirely, and
//!    a response that arrives after its loop was stopped is discarded.
//! 3. **Fresh thresholds**: confidence/IoU are read at send time, so an edit
//!    applies to the very next request.
//! 4. **Cleanup**: stopping (or dropping the controller) cancels the timer,
//!    releases the camera and clears the overlay.
//!
//! # Module Structure
//!
//! - `frame`: `VideoSource`, `Frame`, `FrameCapture`
//! - `ingest`: camera sources (synthetic, HTTP MJPEG, V4L2)
//! - `detect`: thresholds, response types, session, Detection Service client
//! - `overlay`: coordinate mapping, canvas, overlay rendering
//! - `rate`, `scheduler`, `controller`: the loop itself
//! - `config`, `ui`: CLI configuration and terminal output

pub mod config;
pub mod controller;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod overlay;
pub mod rate;
pub mod scheduler;
pub mod ui;

pub use controller::{
    DetectionLoopController, LogNotifier, LoopOptions, LoopParts, LoopState, Notification,
    Notifier,
};
pub use detect::{
    BoundingBox, DetectionConfig, DetectionCycleResult, DetectionService, HttpDetectionService,
    ServiceConfig, Session, Thresholds, TokenSession,
};
pub use error::{LoopError, RequestError};
pub use frame::{Frame, FrameCapture, VideoSource};
pub use ingest::{CameraConfig, CameraDevice, ConfiguredCamera};
pub use overlay::{
    Canvas, CoordinateMapper, DisplayBox, OverlayRenderer, OverlayStyle, RasterCanvas, Region,
    Viewport,
};
pub use rate::RateMonitor;
pub use scheduler::{SchedulerStats, SingleFlightScheduler};
