use crate::detect::config::DetectionConfig;
use crate::detect::result::BoundingBox;
use crate::error::RequestError;
use crate::frame::Frame;

/// Remote detection service.
///
/// Implementations perform one blocking round trip per call. Returned boxes
/// are in the pixel space of `frame`.
pub trait DetectionService: Send + Sync {
    /// Service identifier for logs.
    fn name(&self) -> &str;

    fn detect(
        &self,
        frame: &Frame,
        config: DetectionConfig,
        bearer_token: Option<&str>,
    ) -> Result<Vec<BoundingBox>, RequestError>;
}
