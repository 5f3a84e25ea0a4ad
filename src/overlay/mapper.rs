use crate::detect::BoundingBox;

/// Axis-aligned rectangle in display-space pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Region {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// A detection scaled into display space, ready to draw.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayBox {
    pub region: Region,
    pub class_name: String,
    pub confidence: f32,
}

/// Converts capture-space boxes to display-space boxes.
///
/// The two axes scale independently, so a display with a different aspect
/// ratio than the camera stretches boxes the same way it stretches the video.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoordinateMapper {
    scale_x: f32,
    scale_y: f32,
    valid: bool,
}

impl CoordinateMapper {
    pub fn new(capture: (u32, u32), display: (u32, u32)) -> Self {
        let (capture_w, capture_h) = capture;
        let (display_w, display_h) = display;
        if capture_w == 0 || capture_h == 0 {
            return Self {
                scale_x: 0.0,
                scale_y: 0.0,
                valid: false,
            };
        }
        Self {
            scale_x: display_w as f32 / capture_w as f32,
            scale_y: display_h as f32 / capture_h as f32,
            valid: true,
        }
    }

    pub fn scale(&self) -> (f32, f32) {
        (self.scale_x, self.scale_y)
    }

    /// Map one box. `None` when the capture size is unknown (zero).
    pub fn map(&self, bbox: &BoundingBox) -> Option<DisplayBox> {
        if !self.valid {
            return None;
        }
        let [x1, y1, _, _] = bbox.bbox;
        Some(DisplayBox {
            region: Region::new(
                x1 * self.scale_x,
                y1 * self.scale_y,
                bbox.width() * self.scale_x,
                bbox.height() * self.scale_y,
            ),
            class_name: bbox.class_name.clone(),
            confidence: bbox.confidence,
        })
    }

    /// Map every box, keeping service order.
    pub fn map_all(&self, boxes: &[BoundingBox]) -> Vec<DisplayBox> {
        boxes.iter().filter_map(|b| self.map(b)).collect()
    }
}
