//! Detection Service collaborators.
//!
//! The loop ships frames to a remote service and draws what comes back. This
//! module holds the request thresholds, the response types, the session the
//! bearer credential comes from, and the HTTP client.

mod config;
mod http;
mod result;
mod service;
mod session;

pub use config::{
    DetectionConfig, Thresholds, DEFAULT_CONFIDENCE, DEFAULT_IOU, MAX_THRESHOLD, MIN_THRESHOLD,
};
pub use http::{
    parse_response, HttpDetectionService, ServiceConfig, DEFAULT_FRAME_ENDPOINT,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_SERVICE_URL,
};
pub use result::{BoundingBox, DetectionCycleResult, DetectionResponse};
pub use service::DetectionService;
pub use session::{Session, TokenSession};
