//! Cropping a region of a page image for use as an extra reference image.
//!
//! The user drags a rectangle over the image as displayed, which may be
//! scaled. The rectangle is mapped to native pixels by the ratio of native
//! to displayed size and the crop is encoded as PNG.

use std::io::Cursor;

use image::ImageFormat;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};
use crate::models::FileUpload;
use crate::notify::{Notice, Notifier};

/// Selections smaller than this on either side are ignored.
pub const MIN_REGION_PX: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Size of the image as displayed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplaySize {
    pub width: f64,
    pub height: f64,
}

impl DisplaySize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    fn contains(&self, p: Point) -> bool {
        p.x >= 0.0 && p.y >= 0.0 && p.x <= self.width && p.y <= self.height
    }

    fn clamp(&self, p: Point) -> Point {
        Point::new(p.x.clamp(0.0, self.width), p.y.clamp(0.0, self.height))
    }
}

/// Rectangle in display coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// Rectangle in native pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SelectionRect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    fn between(a: Point, b: Point) -> Self {
        Self {
            left: a.x.min(b.x),
            top: a.y.min(b.y),
            width: (a.x - b.x).abs(),
            height: (a.y - b.y).abs(),
        }
    }

    pub fn is_at_least(&self, min_px: f64) -> bool {
        self.width >= min_px && self.height >= min_px
    }

    /// Map to native pixels, clipped to the image. `None` if nothing is left.
    pub fn to_native(&self, display: DisplaySize, native: (u32, u32)) -> Option<PixelRect> {
        let (native_w, native_h) = native;
        if display.width <= 0.0 || display.height <= 0.0 || native_w == 0 || native_h == 0 {
            return None;
        }
        let scale_x = native_w as f64 / display.width;
        let scale_y = native_h as f64 / display.height;

        let x = (self.left * scale_x).round().max(0.0) as u32;
        let y = (self.top * scale_y).round().max(0.0) as u32;
        if x >= native_w || y >= native_h {
            return None;
        }
        let width = ((self.width * scale_x).round() as u32).clamp(1, native_w - x);
        let height = ((self.height * scale_y).round() as u32).clamp(1, native_h - y);

        Some(PixelRect {
            x,
            y,
            width,
            height,
        })
    }
}

/// Drag state for drawing a selection over a displayed image.
#[derive(Debug, Clone)]
pub struct RegionSelector {
    display: DisplaySize,
    start: Option<Point>,
    rect: Option<SelectionRect>,
}

impl RegionSelector {
    pub fn new(display: DisplaySize) -> Self {
        Self {
            display,
            start: None,
            rect: None,
        }
    }

    /// Start a drag. Presses outside the image are ignored.
    pub fn begin(&mut self, at: Point) -> bool {
        if !self.display.contains(at) {
            return false;
        }
        self.start = Some(at);
        self.rect = None;
        true
    }

    /// Extend the drag; the pointer is clamped to the image.
    pub fn drag(&mut self, to: Point) -> Option<SelectionRect> {
        let start = self.start?;
        let rect = SelectionRect::between(start, self.display.clamp(to));
        self.rect = Some(rect);
        Some(rect)
    }

    /// End the drag. The rectangle stays visible until cleared.
    pub fn finish(&mut self) -> Option<SelectionRect> {
        self.start.take()?;
        self.rect
    }

    pub fn is_dragging(&self) -> bool {
        self.start.is_some()
    }

    pub fn selection(&self) -> Option<SelectionRect> {
        self.rect
    }

    pub fn display(&self) -> DisplaySize {
        self.display
    }

    pub fn clear(&mut self) {
        self.start = None;
        self.rect = None;
    }
}

/// A cropped region ready to upload
#[derive(Debug, Clone)]
pub struct CapturedRegion {
    pub filename: String,
    pub png: bytes::Bytes,
    pub width: u32,
    pub height: u32,
}

impl CapturedRegion {
    pub fn into_upload(self) -> FileUpload {
        FileUpload::new(self.filename, self.png)
    }
}

/// Crop `rect` out of the encoded `source` image.
///
/// Returns `Ok(None)` for selections under `min_px` on either side; those
/// never touch the image.
pub fn capture_region(
    source: &[u8],
    display: DisplaySize,
    rect: &SelectionRect,
    min_px: f64,
) -> ClientResult<Option<CapturedRegion>> {
    if !rect.is_at_least(min_px) {
        tracing::debug!(width = rect.width, height = rect.height, "Selection too small, ignored");
        return Ok(None);
    }
    if source.is_empty() {
        return Err(ClientError::SourceUnreadable("image data is empty".to_string()));
    }

    let img = image::load_from_memory(source)?;
    let Some(pixels) = rect.to_native(display, (img.width(), img.height())) else {
        return Ok(None);
    };

    let cropped = img.crop_imm(pixels.x, pixels.y, pixels.width, pixels.height);
    let mut png = Cursor::new(Vec::new());
    cropped.write_to(&mut png, ImageFormat::Png)?;

    let filename = format!("crop-{}.png", chrono::Utc::now().timestamp_millis());
    tracing::debug!(file = %filename, width = pixels.width, height = pixels.height, "Region captured");

    Ok(Some(CapturedRegion {
        filename,
        png: bytes::Bytes::from(png.into_inner()),
        width: pixels.width,
        height: pixels.height,
    }))
}

/// Per-page image edit context: the prompt and extra context images.
#[derive(Debug, Clone, Default)]
pub struct EditContext {
    pub page_id: String,
    pub prompt: String,
    pub use_template: bool,
    pub desc_image_urls: Vec<String>,
    pub uploaded_files: Vec<FileUpload>,
}

impl EditContext {
    pub fn new(page_id: impl Into<String>) -> Self {
        Self {
            page_id: page_id.into(),
            ..Default::default()
        }
    }

    /// Crop a region and add it to the uploaded images.
    ///
    /// Returns whether an image was added. Failures are reported through the
    /// notifier and leave the context unchanged.
    pub fn add_region(
        &mut self,
        source: &[u8],
        display: DisplaySize,
        rect: &SelectionRect,
        min_px: f64,
        notifier: &dyn Notifier,
    ) -> bool {
        match capture_region(source, display, rect, min_px) {
            Ok(Some(region)) => {
                self.uploaded_files.push(region.into_upload());
                notifier.notify(Notice::success(
                    "Selected region added as a reference image, see the uploaded images below",
                ));
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(page_id = %self.page_id, error = %e, "Region capture failed");
                notifier.notify(Notice::error(e.user_message()));
                false
            }
        }
    }
}
