//! Error taxonomy for the detection loop.
//!
//! Two families, matched on by different callers:
//! - `LoopError`: rejected controller transitions (start webcam, start detection).
//! - `RequestError`: outcome of a single Detection Service round trip.
//!
//! NotReady and CaptureEmpty inside a running loop are not errors at all; the
//! per-tick path reports them as skipped cycles.

use thiserror::Error;

/// Rejected controller transition.
#[derive(Debug, Error)]
pub enum LoopError {
    /// Camera could not be acquired (permission denied, missing device, bad URL).
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),

    /// The source has not buffered enough data yet; retry shortly.
    #[error("video source not ready yet; retry shortly")]
    NotReady,

    /// Detection requested before the webcam was started.
    #[error("webcam is not streaming; start the webcam first")]
    NotStreaming,

    #[error("detection is already running")]
    AlreadyDetecting,

    /// The session carries no usable bearer credential.
    #[error("session is not authenticated; login required")]
    NotAuthenticated,

    /// Frame could not be rasterized or encoded.
    #[error("frame capture failed: {0}")]
    Capture(String),

    #[error("detection scheduler failed to start: {0}")]
    Scheduler(String),
}

/// Failure of one Detection Service request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// HTTP 401: the bearer credential is no longer accepted.
    #[error("session expired; login again")]
    AuthExpired,

    /// Any non-401 HTTP error status.
    #[error("detection service returned HTTP {status}: {detail}")]
    Status { status: u16, detail: String },

    /// Connection, DNS, TLS or timeout failure.
    #[error("detection service unreachable: {0}")]
    Transport(String),

    /// Body was not a valid detection response.
    #[error("invalid detection response: {0}")]
    InvalidResponse(String),

    /// The service answered with `success: false`.
    #[error("detection service reported an unsuccessful detection")]
    Rejected,
}

impl RequestError {
    /// True for failures the loop recovers from by waiting for the next tick.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RequestError::AuthExpired)
    }
}
