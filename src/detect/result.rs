use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One detected object, in capture-space pixels.
///
/// The box is `(x1, y1, x2, y2)` in the pixel space of the submitted frame.
/// Conversion to display space happens only in `CoordinateMapper`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub class_name: String,
    /// Detection confidence in `[0, 1]`.
    pub confidence: f32,
    pub bbox: [f32; 4],
}

impl BoundingBox {
    pub fn new(class_name: impl Into<String>, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
            bbox,
        }
    }

    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }
}

/// Outcome of one completed detection cycle.
///
/// A new result replaces the previous one entirely.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionCycleResult {
    /// Boxes in service order.
    pub boxes: Vec<BoundingBox>,
    /// Capture-space size of the frame the boxes refer to.
    pub capture_size: (u32, u32),
    /// Wall-clock time from capture to render.
    pub duration: Duration,
}

/// Body of a Detection Service response.
#[derive(Debug, Deserialize)]
pub struct DetectionResponse {
    pub success: bool,
    #[serde(default)]
    pub objects_detected: Vec<BoundingBox>,
    #[serde(default)]
    pub model_used: Option<String>,
    #[serde(default)]
    pub total_objects: Option<usize>,
    /// Service-side inference time in seconds.
    #[serde(default)]
    pub processing_time: Option<f64>,
}

/// FastAPI-style error body (`{"detail": "..."}`).
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub detail: serde_json::Value,
}
