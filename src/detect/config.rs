use std::sync::{Arc, Mutex, MutexGuard};

/// Lowest threshold the Detection Service accepts from the loop.
pub const MIN_THRESHOLD: f32 = 0.1;
/// Highest threshold the Detection Service accepts from the loop.
pub const MAX_THRESHOLD: f32 = 0.9;
pub const DEFAULT_CONFIDENCE: f32 = 0.25;
pub const DEFAULT_IOU: f32 = 0.45;

/// Per-request thresholds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionConfig {
    /// Minimum detection confidence, in `[0.1, 0.9]`.
    pub confidence: f32,
    /// Non-max suppression IoU threshold, in `[0.1, 0.9]`.
    pub iou: f32,
}

impl DetectionConfig {
    /// Build a config, clamping both thresholds into the accepted range.
    pub fn new(confidence: f32, iou: f32) -> Self {
        Self {
            confidence: clamp_threshold(confidence),
            iou: clamp_threshold(iou),
        }
    }

    pub fn is_valid(value: f32) -> bool {
        (MIN_THRESHOLD..=MAX_THRESHOLD).contains(&value)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE, DEFAULT_IOU)
    }
}

fn clamp_threshold(value: f32) -> f32 {
    if value.is_nan() {
        return MIN_THRESHOLD;
    }
    value.clamp(MIN_THRESHOLD, MAX_THRESHOLD)
}

/// Shared, always-fresh threshold values.
///
/// Written by the UI, read by the detection loop at send time. Clones share
/// the same values.
#[derive(Clone, Debug, Default)]
pub struct Thresholds {
    inner: Arc<Mutex<DetectionConfig>>,
}

impl Thresholds {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DetectionConfig::new(config.confidence, config.iou))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DetectionConfig> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set the confidence threshold; returns the clamped value stored.
    pub fn set_confidence(&self, confidence: f32) -> f32 {
        let mut config = self.lock();
        config.confidence = clamp_threshold(confidence);
        config.confidence
    }

    /// Set the IoU threshold; returns the clamped value stored.
    pub fn set_iou(&self, iou: f32) -> f32 {
        let mut config = self.lock();
        config.iou = clamp_threshold(iou);
        config.iou
    }

    /// Current values.
    pub fn snapshot(&self) -> DetectionConfig {
        *self.lock()
    }
}
