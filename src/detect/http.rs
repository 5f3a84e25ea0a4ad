//! HTTP Detection Service client.
//!
//! Posts each frame as `multipart/form-data` with fields `file`, `confidence`
//! and `iou`, authenticated with the session's bearer token, and parses the
//! JSON detection response.

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, UNIX_EPOCH};

use crate::detect::config::DetectionConfig;
use crate::detect::result::{BoundingBox, DetectionResponse, ErrorBody};
use crate::detect::service::DetectionService;
use crate::error::RequestError;
use crate::frame::Frame;

pub const DEFAULT_SERVICE_URL: &str = "http://localhost:8000";
pub const DEFAULT_FRAME_ENDPOINT: &str = "/api/predict/webcam/frame";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const FRAME_FILE_NAME: &str = "frame.jpg";
const MAX_DETAIL_CHARS: usize = 200;

/// Where and how to reach the Detection Service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    pub url: String,
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SERVICE_URL.to_string(),
            endpoint: DEFAULT_FRAME_ENDPOINT.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ServiceConfig {
    /// Full frame endpoint URL.
    pub fn frame_url(&self) -> Result<url::Url> {
        let base = url::Url::parse(&self.url)
            .with_context(|| format!("invalid detection service url '{}'", self.url))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(anyhow!(
                "detection service url must be http(s), got '{}'",
                base.scheme()
            ));
        }
        base.join(&self.endpoint)
            .with_context(|| format!("invalid detection endpoint '{}'", self.endpoint))
    }
}

/// Detection Service reached over HTTP.
pub struct HttpDetectionService {
    url: String,
    agent: ureq::Agent,
}

impl HttpDetectionService {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let url = config.frame_url()?.to_string();
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Ok(Self { url, agent })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl DetectionService for HttpDetectionService {
    fn name(&self) -> &str {
        &self.url
    }

    fn detect(
        &self,
        frame: &Frame,
        config: DetectionConfig,
        bearer_token: Option<&str>,
    ) -> Result<Vec<BoundingBox>, RequestError> {
        let boundary = multipart_boundary(frame);
        let body = encode_multipart(&boundary, frame, config);

        let mut request = self
            .agent
            .post(&self.url)
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            )
            .set("Accept", "application/json");
        if let Some(token) = bearer_token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }

        let response = match request.send_bytes(&body) {
            Ok(response) => response,
            Err(ureq::Error::Status(401, _)) => return Err(RequestError::AuthExpired),
            Err(ureq::Error::Status(status, response)) => {
                let detail = error_detail(response.into_string().unwrap_or_default());
                return Err(RequestError::Status { status, detail });
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(RequestError::Transport(transport.to_string()))
            }
        };

        let text = response
            .into_string()
            .map_err(|err| RequestError::InvalidResponse(format!("read body: {}", err)))?;
        parse_response(&text)
    }
}

/// Parse a Detection Service response body into boxes.
pub fn parse_response(body: &str) -> Result<Vec<BoundingBox>, RequestError> {
    let response: DetectionResponse = serde_json::from_str(body)
        .map_err(|err| RequestError::InvalidResponse(err.to_string()))?;
    if !response.success {
        return Err(RequestError::Rejected);
    }
    log::debug!(
        "detection response: model={} objects={} service_time={}",
        response.model_used.as_deref().unwrap_or("unknown"),
        response
            .total_objects
            .unwrap_or(response.objects_detected.len()),
        response
            .processing_time
            .map(|secs| format!("{:.0}ms", secs * 1000.0))
            .unwrap_or_else(|| "n/a".to_string())
    );
    Ok(response.objects_detected)
}

fn error_detail(body: String) -> String {
    let detail = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(ErrorBody {
            detail: serde_json::Value::String(detail),
        }) => detail,
        Ok(ErrorBody { detail }) => detail.to_string(),
        Err(_) => body,
    };
    detail.chars().take(MAX_DETAIL_CHARS).collect()
}

fn multipart_boundary(frame: &Frame) -> String {
    let nanos = frame
        .captured_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("----live-detect-{:x}", nanos)
}

/// Encode the frame and thresholds as a `multipart/form-data` body.
pub(crate) fn encode_multipart(boundary: &str, frame: &Frame, config: DetectionConfig) -> Vec<u8> {
    let mut body = Vec::with_capacity(frame.payload().len() + 512);

    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
            FRAME_FILE_NAME
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", frame.content_type()).as_bytes());
    body.extend_from_slice(frame.payload());
    body.extend_from_slice(b"\r\n");

    for (name, value) in [("confidence", config.confidence), ("iou", config.iou)] {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
        );
        body.extend_from_slice(format!("{}\r\n", value).as_bytes());
    }

    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    body
}
