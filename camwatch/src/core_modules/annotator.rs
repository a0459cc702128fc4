// THEORY:
// The `FrameAnnotator` is the last pure stage before encoding. It receives a frame
// it is allowed to mutate, the resolved detections for that frame, and the class
// filter of the camera the frame came from.
//
// Key architectural principles:
// 1.  **Filtering is the annotator's job**: a detection whose class is not watched
//     is neither drawn nor counted. An empty watch list watches every class.
// 2.  **Counting follows drawing**: the returned count only ever includes boxes
//     that were actually drawn, so the number on screen matches the boxes.
// 3.  **No metrics source of its own**: auxiliary text arrives as an ordered list
//     of `(label, value)` pairs built by the caller.
// 4.  **Text is optional**: labels need a TrueType font. Without one the boxes are
//     still drawn and the count is still returned.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::{info, warn};

use crate::config::CameraConfig;
use crate::core_modules::frame::{Detection, RawFrame};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const COUNT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const OVERLAY_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const BOX_THICKNESS: i32 = 2;

const LABEL_PX: f32 = 24.0;
const COUNT_PX: f32 = 40.0;
const OVERLAY_PX: f32 = 24.0;

/// Baselines of the fixed text rows, in pixels from the top of the frame.
const COUNT_BASELINE: i32 = 50;
const OVERLAY_BASELINE: i32 = 100;
const OVERLAY_LINE_SPACING: i32 = 30;

/// Tried in order when no font path is configured.
const FALLBACK_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
];

/// Which detections of one camera are drawn and which of those are counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassFilter {
    pub watched: BTreeSet<String>,
    pub counted: Option<String>,
    pub count_label: String,
}

impl ClassFilter {
    pub fn watches(&self, class_name: &str) -> bool {
        self.watched.is_empty() || self.watched.contains(class_name)
    }

    pub fn counts(&self, class_name: &str) -> bool {
        self.counted.as_deref() == Some(class_name)
    }
}

impl From<&CameraConfig> for ClassFilter {
    fn from(camera: &CameraConfig) -> Self {
        Self {
            watched: camera.watched_classes.clone(),
            counted: camera.counted_class.clone(),
            count_label: camera.count_label.clone(),
        }
    }
}

#[derive(Clone, Default)]
pub struct FrameAnnotator {
    font: Option<Arc<FontVec>>,
}

impl std::fmt::Debug for FrameAnnotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAnnotator")
            .field("has_font", &self.font.is_some())
            .finish()
    }
}

impl FrameAnnotator {
    pub fn new(font: Option<FontVec>) -> Self {
        Self {
            font: font.map(Arc::new),
        }
    }

    /// Loads the configured font, or the first system font that exists.
    pub fn with_font_path(font_path: Option<&Path>) -> Self {
        let candidates: Vec<PathBuf> = match font_path {
            Some(path) => vec![path.to_path_buf()],
            None => FALLBACK_FONTS.iter().map(PathBuf::from).collect(),
        };

        for path in &candidates {
            let Ok(bytes) = std::fs::read(path) else {
                continue;
            };
            match FontVec::try_from_vec(bytes) {
                Ok(font) => {
                    info!(font = %path.display(), "overlay font loaded");
                    return Self::new(Some(font));
                }
                Err(err) => warn!(font = %path.display(), "invalid font file: {err}"),
            }
        }

        warn!("no usable overlay font found, drawing boxes without text");
        Self::new(None)
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draws the watched detections and overlays onto the frame in place and
    /// returns how many drawn detections belong to the counted class.
    pub fn annotate(
        &self,
        frame: &mut RawFrame,
        detections: &[Detection],
        filter: &ClassFilter,
        overlays: &[(String, String)],
    ) -> usize {
        let image = frame.image_mut();
        let mut match_count = 0;

        for detection in detections.iter().filter(|d| filter.watches(&d.class_name)) {
            let Some(rect) = clip_rect(image, detection) else {
                continue;
            };
            draw_thick_rect(image, rect, BOX_COLOR);

            if filter.counts(&detection.class_name) {
                match_count += 1;
            }

            if let Some(font) = &self.font {
                let baseline = rect.top() + 30;
                draw_text_mut(
                    &mut *image,
                    BOX_COLOR,
                    rect.left() + 10,
                    baseline - LABEL_PX as i32,
                    PxScale::from(LABEL_PX),
                    &**font,
                    &detection.class_name.to_uppercase(),
                );
                draw_text_mut(
                    &mut *image,
                    BOX_COLOR,
                    rect.left() + 200,
                    baseline - LABEL_PX as i32,
                    PxScale::from(LABEL_PX),
                    &**font,
                    &format_confidence(detection.confidence),
                );
            }
        }

        if let Some(font) = &self.font {
            if filter.counted.is_some() {
                draw_text_mut(
                    &mut *image,
                    COUNT_COLOR,
                    10,
                    COUNT_BASELINE - COUNT_PX as i32,
                    PxScale::from(COUNT_PX),
                    &**font,
                    &format!("{}: {}", filter.count_label, match_count),
                );
            }

            for (row, (label, value)) in overlays.iter().enumerate() {
                let baseline = OVERLAY_BASELINE + OVERLAY_LINE_SPACING * row as i32;
                draw_text_mut(
                    &mut *image,
                    OVERLAY_COLOR,
                    10,
                    baseline - OVERLAY_PX as i32,
                    PxScale::from(OVERLAY_PX),
                    &**font,
                    &format!("{label}: {value}"),
                );
            }
        }

        match_count
    }
}

/// Confidence as a percentage with at most two decimals, e.g. `87.35`.
fn format_confidence(confidence: f32) -> String {
    let pct = (f64::from(confidence) * 10_000.0).round() / 100.0;
    format!("{pct}")
}

/// Clips a detection box to the image; `None` when nothing is left to draw.
fn clip_rect(image: &RgbImage, detection: &Detection) -> Option<Rect> {
    let bbox = &detection.bbox;
    let x0 = bbox.x.max(0.0).floor() as i64;
    let y0 = bbox.y.max(0.0).floor() as i64;
    let x1 = bbox.right().min(image.width() as f32).ceil() as i64;
    let y1 = bbox.bottom().min(image.height() as f32).ceil() as i64;

    if !bbox.width.is_finite() || !bbox.height.is_finite() || x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(Rect::at(x0 as i32, y0 as i32).of_size((x1 - x0) as u32, (y1 - y0) as u32))
}

fn draw_thick_rect(image: &mut RgbImage, rect: Rect, color: Rgb<u8>) {
    for inset in 0..BOX_THICKNESS {
        let width = rect.width() as i32 - 2 * inset;
        let height = rect.height() as i32 - 2 * inset;
        if width <= 0 || height <= 0 {
            break;
        }
        let inner = Rect::at(rect.left() + inset, rect.top() + inset).of_size(width as u32, height as u32);
        draw_hollow_rect_mut(image, inner, color);
    }
}
