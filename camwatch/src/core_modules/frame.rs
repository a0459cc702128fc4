// THEORY:
// The `frame` module holds the data that flows through a camera pipeline, in the
// order it is produced:
//
// 1.  **RawFrame**: a decoded RGB image plus the capture sequence number the
//     pipeline stamped on it. It is owned by exactly one pipeline and is mutated
//     in place by the annotator, so it is never shared.
// 2.  **RawDetection / Detection**: what the model reported, before and after the
//     class id has been resolved to a name.
// 3.  **AnnotatedFrame**: the JPEG encoding of a finished frame. It is immutable
//     once built and cheap to clone (`Bytes`), which is what lets any number of
//     viewers hold the same frame at once.

use std::io::Cursor;
use std::time::Instant;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageResult, RgbImage};

/// A decoded frame straight from a camera, tagged with its capture sequence.
#[derive(Debug, Clone)]
pub struct RawFrame {
    image: RgbImage,
    sequence: u64,
    captured_at: Instant,
}

impl RawFrame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    /// Compresses the frame into the still-image format served to viewers.
    pub fn encode_jpeg(&self, quality: u8) -> ImageResult<AnnotatedFrame> {
        let mut buf = Cursor::new(Vec::with_capacity(self.image.as_raw().len() / 8));
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
        encoder.encode_image(&self.image)?;

        Ok(AnnotatedFrame {
            jpeg: Bytes::from(buf.into_inner()),
            sequence: self.sequence,
            width: self.width(),
            height: self.height(),
        })
    }
}

/// An axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let l = self.x.max(other.x);
        let r = self.right().min(other.right());
        let t = self.y.max(other.y);
        let b = self.bottom().min(other.bottom());
        (r - l).max(0.0) * (b - t).max(0.0)
    }

    /// Intersection over union; zero when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }
}

/// One candidate as the model reported it. Class ids are 1-indexed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub class_id: i32,
    pub confidence: f32,
}

impl RawDetection {
    pub fn new(bbox: BoundingBox, class_id: i32, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            confidence,
        }
    }
}

/// A detection whose class id resolved to an entry of the class table.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: i32,
    pub class_name: String,
    pub confidence: f32,
}

/// Encoded frame bytes plus the sequence number of the frame they came from.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub jpeg: Bytes,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        let b = BoundingBox::new(100.0, 100.0, 20.0, 20.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        // 50 / (100 + 100 - 50)
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate_box() {
        let a = BoundingBox::new(0.0, 0.0, 0.0, 0.0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn test_encode_jpeg_keeps_sequence() {
        let frame = RawFrame::new(RgbImage::new(16, 8), 42);
        let encoded = frame.encode_jpeg(80).unwrap();
        assert_eq!(encoded.sequence, 42);
        assert_eq!((encoded.width, encoded.height), (16, 8));
        assert_eq!(&encoded.jpeg[0..2], &[0xFF, 0xD8]);
    }
}
