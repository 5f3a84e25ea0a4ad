use image::Rgba;

use super::canvas::Canvas;
use super::mapper::{DisplayBox, Region};

/// Visual parameters of the detection overlay.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OverlayStyle {
    pub box_color: Rgba<u8>,
    pub line_width: u32,
    pub text_color: Rgba<u8>,
    pub font_px: f32,
    /// Height of the filled label chip above each box.
    pub label_height: f32,
    /// Horizontal padding on each side of the label text.
    pub label_padding: f32,
    /// Distance from the box's top edge up to the label baseline.
    pub baseline_offset: f32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            box_color: Rgba([0, 255, 0, 255]),
            line_width: 3,
            text_color: Rgba([0, 0, 0, 255]),
            font_px: 16.0,
            label_height: 25.0,
            label_padding: 5.0,
            baseline_offset: 7.0,
        }
    }
}

/// Label drawn above a box: class name and whole-percent confidence.
pub fn label_for(class_name: &str, confidence: f32) -> String {
    format!("{} {}%", class_name, (confidence * 100.0).round() as i32)
}

/// Draws display-space boxes onto a canvas.
#[derive(Clone, Debug, Default)]
pub struct OverlayRenderer {
    style: OverlayStyle,
}

impl OverlayRenderer {
    pub fn new(style: OverlayStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> &OverlayStyle {
        &self.style
    }

    /// Redraw the overlay from scratch.
    ///
    /// The canvas is first brought to `display_size`, then cleared; an empty
    /// `boxes` leaves it blank.
    pub fn render(&self, canvas: &mut dyn Canvas, display_size: (u32, u32), boxes: &[DisplayBox]) {
        if canvas.size() != display_size {
            log::debug!(
                "overlay resize {:?} -> {:?}",
                canvas.size(),
                display_size
            );
            canvas.resize(display_size.0, display_size.1);
        }
        canvas.clear();

        let style = &self.style;
        for display_box in boxes {
            let region = display_box.region;
            canvas.stroke_rect(region, style.line_width, style.box_color);

            let label = label_for(&display_box.class_name, display_box.confidence);
            let text_width = canvas.measure_text(&label, style.font_px);
            canvas.fill_rect(
                Region::new(
                    region.x,
                    region.y - style.label_height,
                    text_width + 2.0 * style.label_padding,
                    style.label_height,
                ),
                style.box_color,
            );
            canvas.fill_text(
                &label,
                region.x + style.label_padding,
                region.y - style.baseline_offset,
                style.font_px,
                style.text_color,
            );
        }
    }

    /// Blank the overlay without drawing anything.
    pub fn clear(&self, canvas: &mut dyn Canvas) {
        canvas.clear();
    }
}
