//! Labeled detection boxes for the kiosk display.
//!
//! Boxes come off the detector in camera coordinates and are rescaled to the
//! display surface before they are drawn or published.

use facecheckin_core::BoundingBox;
use facecheckin_hw::frame::{encode_jpeg, FrameError};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

const RECOGNIZED: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN: Rgb<u8> = Rgb([220, 0, 0]);
const STROKE: u32 = 2;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("failed to encode overlay: {0}")]
    Encode(#[from] FrameError),
    #[error("failed to write overlay {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// Most recent display overlay, read by the status surface.
pub type LatestOverlay = Arc<Mutex<Option<Overlay>>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledBox {
    pub label: String,
    pub similarity: f32,
    pub recognized: bool,
    pub bbox: BoundingBox,
}

/// Boxes for one frame, in the coordinate space of `width` x `height`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overlay {
    pub width: u32,
    pub height: u32,
    pub boxes: Vec<LabeledBox>,
}

impl Overlay {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, boxes: Vec::new() }
    }

    pub fn push(&mut self, label: impl Into<String>, similarity: f32, recognized: bool, bbox: BoundingBox) {
        self.boxes.push(LabeledBox { label: label.into(), similarity, recognized, bbox });
    }

    /// The same overlay in a `width` x `height` coordinate space.
    pub fn resized(&self, width: u32, height: u32) -> Overlay {
        if self.width == 0 || self.height == 0 {
            return Overlay::new(width, height);
        }
        let sx = width as f32 / self.width as f32;
        let sy = height as f32 / self.height as f32;
        Overlay {
            width,
            height,
            boxes: self
                .boxes
                .iter()
                .map(|b| LabeledBox { bbox: b.bbox.scaled(sx, sy), ..b.clone() })
                .collect(),
        }
    }

    /// Outline every box on an image of this overlay's size.
    pub fn draw(&self, canvas: &mut RgbImage) {
        for b in &self.boxes {
            let colour = if b.recognized { RECOGNIZED } else { UNKNOWN };
            draw_rect(canvas, &b.bbox, colour);
        }
    }

    /// Scale `frame` to this overlay's size and draw the boxes on it.
    pub fn render(&self, frame: &RgbImage) -> RgbImage {
        let mut canvas = if frame.dimensions() == (self.width, self.height) {
            frame.clone()
        } else {
            imageops::resize(frame, self.width, self.height, FilterType::Triangle)
        };
        self.draw(&mut canvas);
        canvas
    }
}

/// Hollow rectangle, clipped to the canvas.
fn draw_rect(canvas: &mut RgbImage, bbox: &BoundingBox, colour: Rgb<u8>) {
    let (w, h) = canvas.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp = |v: f32, max: u32| (v.round().max(0.0) as u32).min(max - 1);
    let x0 = clamp(bbox.x, w);
    let y0 = clamp(bbox.y, h);
    let x1 = clamp(bbox.x + bbox.width, w);
    let y1 = clamp(bbox.y + bbox.height, h);

    for t in 0..STROKE {
        for x in x0..=x1 {
            canvas.put_pixel(x, (y0 + t).min(y1), colour);
            canvas.put_pixel(x, y1.saturating_sub(t).max(y0), colour);
        }
        for y in y0..=y1 {
            canvas.put_pixel((x0 + t).min(x1), y, colour);
            canvas.put_pixel(x1.saturating_sub(t).max(x0), y, colour);
        }
    }
}

/// Render and write the annotated frame as JPEG.
///
/// Written to a sibling temp file and renamed, so a viewer polling the path
/// never reads a half-written image.
pub fn write_annotated(frame: &RgbImage, overlay: &Overlay, path: &Path) -> Result<(), OverlayError> {
    let jpeg = encode_jpeg(&overlay.render(frame), 85)?;
    let tmp = path.with_extension("jpg.tmp");
    let io_err = |source| OverlayError::Write { path: path.display().to_string(), source };
    std::fs::write(&tmp, &jpeg).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9, landmarks: None }
    }

    #[test]
    fn test_resized_scales_boxes_to_display() {
        let mut overlay = Overlay::new(640, 480);
        overlay.push("An", 0.8, true, bbox(320.0, 240.0, 64.0, 48.0));
        let display = overlay.resized(720, 560);

        assert_eq!((display.width, display.height), (720, 560));
        let b = &display.boxes[0].bbox;
        assert!((b.x - 360.0).abs() < 1e-3);
        assert!((b.y - 280.0).abs() < 1e-3);
        assert!((b.width - 72.0).abs() < 1e-3);
        assert!((b.height - 56.0).abs() < 1e-3);
        assert_eq!(display.boxes[0].label, "An");
    }

    #[test]
    fn test_render_colours_by_recognition() {
        let frame = RgbImage::new(100, 100);
        let mut overlay = Overlay::new(100, 100);
        overlay.push("An", 0.8, true, bbox(10.0, 10.0, 20.0, 20.0));
        overlay.push("unknown", 0.1, false, bbox(60.0, 60.0, 20.0, 20.0));

        let canvas = overlay.render(&frame);
        assert_eq!(*canvas.get_pixel(10, 10), RECOGNIZED);
        assert_eq!(*canvas.get_pixel(60, 60), UNKNOWN);
        // Interior untouched.
        assert_eq!(*canvas.get_pixel(20, 20), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_boxes_past_the_edge_are_clipped() {
        let frame = RgbImage::new(32, 32);
        let mut overlay = Overlay::new(32, 32);
        overlay.push("An", 0.9, true, bbox(-10.0, 20.0, 100.0, 100.0));
        let canvas = overlay.render(&frame);
        assert_eq!(*canvas.get_pixel(0, 31), RECOGNIZED);
    }

    #[test]
    fn test_write_annotated_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.jpg");
        let frame = RgbImage::from_pixel(64, 48, Rgb([90, 90, 90]));
        let overlay = Overlay::new(64, 48).resized(72, 56);

        write_annotated(&frame, &overlay, &path).unwrap();
        write_annotated(&frame, &overlay, &path).unwrap();

        let written = image::open(&path).unwrap();
        assert_eq!((written.width(), written.height()), (72, 56));
        assert!(!path.with_extension("jpg.tmp").exists());
    }
}
