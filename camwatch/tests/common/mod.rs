//! Scripted fakes shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::RgbImage;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use camwatch::config::{CameraConfig, CameraId, PipelineSettings};
use camwatch::{
    AnnotatedFrame, BoundingBox, CameraSource, CameraStream, ClassTable, DetectionAdapter,
    DetectionError, ObjectDetector, RawDetection, RawFrame, SourceError,
};

pub const FRAME_WIDTH: u32 = 32;
pub const FRAME_HEIGHT: u32 = 24;

/// A counter tests can wait on.
#[derive(Default)]
pub struct Counter {
    value: AtomicUsize,
    notify: Notify,
}

impl Counter {
    pub fn get(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    /// Increments and returns the value before the increment.
    pub fn bump(&self) -> usize {
        let previous = self.value.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        previous
    }

    pub async fn wait_for(&self, at_least: usize) {
        loop {
            let notified = self.notify.notified();
            if self.get() >= at_least {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Frame,
    Corrupt,
    End,
}

/// Fails `open` a fixed number of times, then hands out streams that play
/// `script` once and stall, or replay it forever when looping.
pub struct ScriptedSource {
    failures_before_success: usize,
    script: Vec<Step>,
    looping: bool,
    pub opens: Counter,
    /// When each `open` was called, on tokio's clock.
    pub open_times: Mutex<Vec<Instant>>,
    /// Bumped each time a stream runs out of script and stalls.
    pub exhausted: Arc<Counter>,
}

impl ScriptedSource {
    pub fn new(failures_before_success: usize, script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            failures_before_success,
            script,
            looping: false,
            opens: Counter::default(),
            open_times: Mutex::new(Vec::new()),
            exhausted: Arc::new(Counter::default()),
        })
    }

    pub fn frames(failures_before_success: usize, frames: usize) -> Arc<Self> {
        Self::new(failures_before_success, vec![Step::Frame; frames])
    }

    pub fn looping(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            failures_before_success: 0,
            script,
            looping: true,
            opens: Counter::default(),
            open_times: Mutex::new(Vec::new()),
            exhausted: Arc::new(Counter::default()),
        })
    }

    /// Never opens successfully.
    pub fn unreachable() -> Arc<Self> {
        Self::new(usize::MAX, Vec::new())
    }

    pub fn opens(&self) -> usize {
        self.opens.get()
    }

    /// Time between consecutive `open` calls.
    pub fn open_gaps(&self) -> Vec<std::time::Duration> {
        let times = self.open_times.lock();
        times.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }
}

#[async_trait]
impl CameraSource for ScriptedSource {
    async fn open(&self, url: &str) -> Result<Box<dyn CameraStream>, SourceError> {
        self.open_times.lock().push(Instant::now());
        let attempt = self.opens.bump();
        if attempt < self.failures_before_success {
            return Err(SourceError::Unavailable {
                url: url.to_string(),
                reason: format!("scripted failure {}", attempt + 1),
            });
        }
        Ok(Box::new(ScriptedStream {
            script: self.script.clone(),
            position: 0,
            looping: self.looping,
            exhausted: Arc::clone(&self.exhausted),
        }))
    }
}

struct ScriptedStream {
    script: Vec<Step>,
    position: usize,
    looping: bool,
    exhausted: Arc<Counter>,
}

#[async_trait]
impl CameraStream for ScriptedStream {
    async fn read_frame(&mut self) -> Result<RgbImage, SourceError> {
        if self.looping && self.position == self.script.len() {
            self.position = 0;
        }
        let Some(step) = self.script.get(self.position).copied() else {
            self.exhausted.bump();
            return std::future::pending().await;
        };
        self.position += 1;
        match step {
            Step::Frame => Ok(RgbImage::new(FRAME_WIDTH, FRAME_HEIGHT)),
            Step::Corrupt => Err(SourceError::CorruptFrame("scripted corrupt frame".to_string())),
            Step::End => Err(SourceError::StreamEnded("scripted end of stream".to_string())),
        }
    }
}

/// Reports one person in the top-left corner of every frame.
pub fn person_detector() -> Box<dyn ObjectDetector> {
    Box::new(|_: &RawFrame, _: f32, _: f32| {
        Ok::<_, DetectionError>(vec![RawDetection::new(
            BoundingBox::new(2.0, 2.0, 10.0, 10.0),
            1,
            0.9,
        )])
    })
}

/// Like `person_detector`, counting its calls.
pub fn counting_detector(calls: Arc<Counter>) -> Box<dyn ObjectDetector> {
    Box::new(move |_: &RawFrame, _: f32, _: f32| {
        calls.bump();
        Ok::<_, DetectionError>(vec![RawDetection::new(
            BoundingBox::new(2.0, 2.0, 10.0, 10.0),
            1,
            0.9,
        )])
    })
}

pub fn failing_detector() -> Box<dyn ObjectDetector> {
    Box::new(|_: &RawFrame, _: f32, _: f32| {
        Err::<Vec<RawDetection>, _>(DetectionError::Inference("scripted inference failure".to_string()))
    })
}

pub fn classes() -> Arc<ClassTable> {
    Arc::new(ClassTable::new(["person", "bicycle", "car"]))
}

pub fn adapter(detector: Box<dyn ObjectDetector>) -> DetectionAdapter {
    DetectionAdapter::new(detector, classes())
}

pub fn camera(id: CameraId) -> CameraConfig {
    let mut camera = CameraConfig::new(id, format!("scripted://cam{id}"));
    camera.watched_classes.insert("person".to_string());
    camera.counted_class = Some("person".to_string());
    camera
}

pub fn settings(reconnect_backoff_ms: u64, max_consecutive_failures: u32) -> PipelineSettings {
    PipelineSettings {
        reconnect_backoff_ms,
        max_consecutive_failures,
        system_metrics: false,
        ..PipelineSettings::default()
    }
}

/// A tiny encoded frame whose bytes spell out its sequence number.
pub fn frame(sequence: u64) -> AnnotatedFrame {
    AnnotatedFrame {
        jpeg: Bytes::from(sequence.to_be_bytes().to_vec()),
        sequence,
        width: 1,
        height: 1,
    }
}
