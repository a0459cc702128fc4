//! `VideoCapture` backed source for anything OpenCV can open (RTSP, files, MJPEG).

use async_trait::async_trait;
use image::RgbImage;
use opencv::core::Mat;
use opencv::imgproc;
use opencv::prelude::*;
use opencv::videoio::{VideoCapture, CAP_ANY};

use crate::error::SourceError;
use crate::source::{CameraSource, CameraStream};

#[derive(Debug, Default)]
pub struct OpenCvSource;

impl OpenCvSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CameraSource for OpenCvSource {
    async fn open(&self, url: &str) -> Result<Box<dyn CameraStream>, SourceError> {
        let target = url.to_string();
        let capture = tokio::task::spawn_blocking(move || open_capture(&target))
            .await
            .map_err(|e| SourceError::Unavailable {
                url: url.to_string(),
                reason: e.to_string(),
            })??;

        Ok(Box::new(OpenCvStream {
            capture: Some(capture),
        }))
    }
}

fn open_capture(url: &str) -> Result<VideoCapture, SourceError> {
    let unavailable = |reason: String| SourceError::Unavailable {
        url: url.to_string(),
        reason,
    };
    let capture = VideoCapture::from_file(url, CAP_ANY).map_err(|e| unavailable(e.to_string()))?;
    if !capture.is_opened().map_err(|e| unavailable(e.to_string()))? {
        return Err(unavailable("VideoCapture failed to open".to_string()));
    }
    Ok(capture)
}

struct OpenCvStream {
    /// Moved into the blocking worker for each read and put back afterwards.
    capture: Option<VideoCapture>,
}

#[async_trait]
impl CameraStream for OpenCvStream {
    async fn read_frame(&mut self) -> Result<RgbImage, SourceError> {
        let mut capture = self
            .capture
            .take()
            .ok_or_else(|| SourceError::StreamEnded("capture lost by a failed read".to_string()))?;

        let (capture, result) = tokio::task::spawn_blocking(move || {
            let result = read_rgb(&mut capture);
            (capture, result)
        })
        .await
        .map_err(|e| SourceError::StreamEnded(e.to_string()))?;

        self.capture = Some(capture);
        result
    }
}

fn read_rgb(capture: &mut VideoCapture) -> Result<RgbImage, SourceError> {
    let ended = |e: opencv::Error| SourceError::StreamEnded(e.to_string());

    let mut bgr = Mat::default();
    if !capture.read(&mut bgr).map_err(ended)? || bgr.empty() {
        return Err(SourceError::StreamEnded("no frame returned".to_string()));
    }

    let mut rgb = Mat::default();
    imgproc::cvt_color(&bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0)
        .map_err(|e| SourceError::CorruptFrame(e.to_string()))?;

    let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
    let pixels = rgb
        .data_bytes()
        .map_err(|e| SourceError::CorruptFrame(e.to_string()))?
        .to_vec();
    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| SourceError::CorruptFrame(format!("unexpected buffer size for {width}x{height}")))
}
