//! Drawing surfaces for the overlay.

use ab_glyph::{Font, FontArc, PxScale, ScaleFont};
use anyhow::{anyhow, Context, Result};
use image::{imageops, DynamicImage, Rgba, RgbImage, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::mapper::Region;

/// Average glyph advance relative to the font size, used when no font is loaded.
const FALLBACK_ADVANCE: f32 = 0.6;

/// DejaVu Sans, used for labels unless another font is configured.
static DEFAULT_FONT: &[u8] = include_bytes!("../../assets/fonts/DejaVuSans.ttf");

/// A 2D drawing surface sized in display pixels.
///
/// Coordinates are display-space floats; implementations round as needed.
pub trait Canvas: Send {
    fn size(&self) -> (u32, u32);

    /// Change the surface size. Contents after a resize are unspecified.
    fn resize(&mut self, width: u32, height: u32);

    /// Erase the whole surface to transparent.
    fn clear(&mut self);

    /// Outline `region` with a stroke `line_width` pixels wide, centered on the edge.
    fn stroke_rect(&mut self, region: Region, line_width: u32, color: Rgba<u8>);

    fn fill_rect(&mut self, region: Region, color: Rgba<u8>);

    /// Draw `text` with its left edge at `x` and its baseline at `baseline_y`.
    fn fill_text(&mut self, text: &str, x: f32, baseline_y: f32, font_px: f32, color: Rgba<u8>);

    /// Advance width of `text` at `font_px`.
    fn measure_text(&self, text: &str, font_px: f32) -> f32;

    /// Copy of the current contents, when the surface is backed by pixels.
    fn to_image(&self) -> Option<RgbaImage> {
        None
    }
}

// ----------------------------------------------------------------------------
// RasterCanvas
// ----------------------------------------------------------------------------

/// In-memory RGBA canvas.
///
/// Labels use the bundled DejaVu Sans unless `with_font` replaces it.
#[derive(Clone)]
pub struct RasterCanvas {
    image: RgbaImage,
    font: Option<FontArc>,
}

impl RasterCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
            font: default_font(),
        }
    }

    pub fn with_font(mut self, font: FontArc) -> Self {
        self.font = Some(font);
        self
    }

    /// Load a TrueType/OpenType font from disk.
    pub fn load_font(path: &Path) -> Result<FontArc> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read font {}", path.display()))?;
        FontArc::try_from_vec(bytes).map_err(|_| anyhow!("invalid font file {}", path.display()))
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Scale `frame` to the canvas size and draw the overlay on top of it.
    pub fn composite_onto(&self, frame: &RgbImage) -> RgbaImage {
        composite(frame, &self.image)
    }

    fn pixel_rect(region: Region) -> Option<Rect> {
        let left = region.x.round() as i32;
        let top = region.y.round() as i32;
        let width = region.width.round();
        let height = region.height.round();
        if width < 1.0 || height < 1.0 {
            return None;
        }
        Some(Rect::at(left, top).of_size(width as u32, height as u32))
    }
}

impl Canvas for RasterCanvas {
    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.image = RgbaImage::new(width, height);
    }

    fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }
    }

    fn stroke_rect(&mut self, region: Region, line_width: u32, color: Rgba<u8>) {
        let line_width = line_width.max(1);
        let inset = (line_width / 2) as f32;
        for ring in 0..line_width {
            let grow = ring as f32 - inset;
            let ring_region = Region::new(
                region.x - grow,
                region.y - grow,
                region.width + 2.0 * grow,
                region.height + 2.0 * grow,
            );
            if let Some(rect) = Self::pixel_rect(ring_region) {
                draw_hollow_rect_mut(&mut self.image, rect, color);
            }
        }
    }

    fn fill_rect(&mut self, region: Region, color: Rgba<u8>) {
        if let Some(rect) = Self::pixel_rect(region) {
            draw_filled_rect_mut(&mut self.image, rect, color);
        }
    }

    fn fill_text(&mut self, text: &str, x: f32, baseline_y: f32, font_px: f32, color: Rgba<u8>) {
        let Some(font) = &self.font else {
            log::warn!("no font loaded; label '{}' not drawn", text);
            return;
        };
        let scale = PxScale::from(font_px);
        let ascent = font.as_scaled(scale).ascent();
        let top = (baseline_y - ascent).round() as i32;
        draw_text_mut(&mut self.image, color, x.round() as i32, top, scale, font, text);
    }

    fn measure_text(&self, text: &str, font_px: f32) -> f32 {
        match &self.font {
            Some(font) => text_size(PxScale::from(font_px), font, text).0 as f32,
            None => text.chars().count() as f32 * font_px * FALLBACK_ADVANCE,
        }
    }

    fn to_image(&self) -> Option<RgbaImage> {
        Some(self.image.clone())
    }
}

fn default_font() -> Option<FontArc> {
    match FontArc::try_from_slice(DEFAULT_FONT) {
        Ok(font) => Some(font),
        Err(_) => {
            log::warn!("bundled label font failed to parse; labels will not be drawn");
            None
        }
    }
}

/// Scale `frame` to the overlay's size and draw `overlay` on top of it.
pub fn composite(frame: &RgbImage, overlay: &RgbaImage) -> RgbaImage {
    let (width, height) = overlay.dimensions();
    let scaled = imageops::resize(frame, width, height, imageops::FilterType::Triangle);
    let mut base = DynamicImage::ImageRgb8(scaled).to_rgba8();
    imageops::overlay(&mut base, overlay, 0, 0);
    base
}

// ----------------------------------------------------------------------------
// Viewport
// ----------------------------------------------------------------------------

/// Live display size of the video element the overlay sits on.
///
/// Clones share the same size; the layout side writes it, the renderer reads
/// it on every call.
#[derive(Clone, Debug)]
pub struct Viewport {
    size: Arc<Mutex<(u32, u32)>>,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: Arc::new(Mutex::new((width, height))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, (u32, u32)> {
        self.size.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_size(&self, width: u32, height: u32) {
        *self.lock() = (width, height);
    }

    pub fn size(&self) -> (u32, u32) {
        *self.lock()
    }
}
