//! Detection overlay.
//!
//! Boxes arrive in capture space. `CoordinateMapper` scales them to the live
//! display size, and `OverlayRenderer` redraws the whole overlay onto a
//! `Canvas` every cycle.

mod canvas;
mod mapper;
mod render;

pub use canvas::{composite, Canvas, RasterCanvas, Viewport};
pub use mapper::{CoordinateMapper, DisplayBox, Region};
pub use render::{label_for, OverlayRenderer, OverlayStyle};
