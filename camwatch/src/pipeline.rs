// THEORY:
// The `CameraPipeline` is the per-camera engine. One instance exists per configured
// camera and runs as its own task for the life of the process, whether zero or a
// hundred viewers are watching.
//
// Key architectural principles:
// 1.  **The pipeline owns retry policy**: sources make single attempts. Every new
//     attempt, after a failed open or a lost stream alike, waits one backoff
//     interval first, so a camera that accepts and then hangs up at once is not
//     hammered with requests. Nothing here ever terminates the process.
// 2.  **Fail open per frame**: when detection fails, the frame is still published,
//     just without overlays, so viewers keep seeing live video. Only a run of
//     consecutive failures forces a reconnect, since that usually means the source
//     itself is producing garbage.
// 3.  **CPU work off the executor**: detection, drawing and encoding run on the
//     blocking pool. The detector sits behind a per-camera lock that only this
//     pipeline ever takes, so cameras never contend with each other.
// 4.  **Ordered publication**: each frame is fully processed before the next one is
//     read, so versions in the slot follow capture order.
// 5.  **Prompt shutdown**: every await that can block (open, read, backoff) races the
//     shutdown signal, and dropping the stream releases the camera connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::LatestFrameBroadcaster;
use crate::config::{CameraConfig, CameraId, PipelineSettings};
use crate::core_modules::annotator::{ClassFilter, FrameAnnotator};
use crate::core_modules::frame::{AnnotatedFrame, RawFrame};
use crate::detection::DetectionAdapter;
use crate::error::{DetectionError, PipelineError, SourceError};
use crate::metrics::MetricsSource;
use crate::source::{CameraSource, CameraStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Disconnected,
    Connecting,
    Streaming,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Disconnected => "disconnected",
            PipelineState::Connecting => "connecting",
            PipelineState::Streaming => "streaming",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves once shutdown has been requested or the signal's sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleeps one backoff interval; true when shutdown arrived first.
async fn backoff_or_shutdown(backoff: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown) => true,
        _ = tokio::time::sleep(backoff) => false,
    }
}

/// The result of the blocking part of one frame's processing.
struct ProcessedFrame {
    frame: AnnotatedFrame,
    detections: usize,
    match_count: usize,
    detection_error: Option<DetectionError>,
}

enum StreamExit {
    Reconnect,
    Shutdown,
    Halt,
}

pub struct CameraPipeline {
    camera: CameraConfig,
    settings: PipelineSettings,
    source: Arc<dyn CameraSource>,
    adapter: Arc<Mutex<DetectionAdapter>>,
    annotator: FrameAnnotator,
    filter: Arc<ClassFilter>,
    metrics: Option<Arc<dyn MetricsSource>>,
    broadcaster: LatestFrameBroadcaster,
    state_tx: watch::Sender<PipelineState>,
    next_sequence: u64,
    consecutive_failures: u32,
}

impl CameraPipeline {
    pub fn new(
        camera: CameraConfig,
        settings: PipelineSettings,
        source: Arc<dyn CameraSource>,
        adapter: DetectionAdapter,
        broadcaster: LatestFrameBroadcaster,
    ) -> Self {
        let filter = Arc::new(ClassFilter::from(&camera));
        Self {
            camera,
            settings,
            source,
            adapter: Arc::new(Mutex::new(adapter)),
            annotator: FrameAnnotator::default(),
            filter,
            metrics: None,
            broadcaster,
            state_tx: watch::Sender::new(PipelineState::Disconnected),
            next_sequence: 0,
            consecutive_failures: 0,
        }
    }

    pub fn with_annotator(mut self, annotator: FrameAnnotator) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSource>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera.id
    }

    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: PipelineState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            info!(camera_id = self.camera.id, state = %next, "pipeline state changed");
        }
    }

    /// Runs until `shutdown` turns true. Connection problems are handled here and
    /// never end the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let camera_id = self.camera.id;
        let backoff = self.settings.reconnect_backoff();
        info!(camera_id, url = %self.camera.url, process_every = self.camera.process_every, "pipeline started");

        loop {
            // a zero backoff must still let other tasks run
            tokio::task::yield_now().await;
            self.set_state(PipelineState::Connecting);
            let opened = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                opened = self.source.open(&self.camera.url) => opened,
            };

            let stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    self.set_state(PipelineState::Disconnected);
                    warn!(camera_id, error = %e, backoff_ms = backoff.as_millis() as u64, "camera unavailable, retrying");
                    if backoff_or_shutdown(backoff, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.consecutive_failures = 0;
            self.set_state(PipelineState::Streaming);
            let exit = self.stream_frames(stream, &mut shutdown).await;
            self.set_state(PipelineState::Disconnected);

            match exit {
                StreamExit::Reconnect => {
                    debug!(camera_id, backoff_ms = backoff.as_millis() as u64, "waiting before reconnect");
                    if backoff_or_shutdown(backoff, &mut shutdown).await {
                        break;
                    }
                }
                StreamExit::Shutdown | StreamExit::Halt => break,
            }
        }

        self.set_state(PipelineState::Disconnected);
        info!(camera_id, frames = self.next_sequence, "pipeline stopped");
    }

    /// The `Streaming` state. Consumes the stream, so the connection is closed
    /// whichever way this returns.
    async fn stream_frames(
        &mut self,
        mut stream: Box<dyn CameraStream>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamExit {
        let camera_id = self.camera.id;
        loop {
            let read = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return StreamExit::Shutdown,
                read = stream.read_frame() => read,
            };

            let image = match read {
                Ok(image) => image,
                Err(SourceError::CorruptFrame(reason)) => {
                    warn!(camera_id, %reason, "dropping corrupt frame");
                    if self.record_failure() {
                        return StreamExit::Reconnect;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(camera_id, error = %e, "camera stream lost, reconnecting");
                    return StreamExit::Reconnect;
                }
            };

            let sequence = self.next_sequence;
            self.next_sequence += 1;
            if sequence % u64::from(self.camera.process_every) != 0 {
                trace!(camera_id, sequence, "frame skipped by decimation");
                continue;
            }

            let processed = match self.process(RawFrame::new(image, sequence)).await {
                Ok(processed) => processed,
                Err(e) => {
                    warn!(camera_id, sequence, error = %e, "frame processing failed");
                    if self.record_failure() {
                        return StreamExit::Reconnect;
                    }
                    continue;
                }
            };

            let failed = match &processed.detection_error {
                Some(e) => {
                    warn!(camera_id, sequence, error = %e, "detection failed, publishing frame unannotated");
                    true
                }
                None => {
                    debug!(
                        camera_id,
                        sequence,
                        detections = processed.detections,
                        count = processed.match_count,
                        "frame processed"
                    );
                    self.consecutive_failures = 0;
                    false
                }
            };

            if let Err(e) = self.broadcaster.publish(camera_id, processed.frame) {
                error!(camera_id, error = %e, "no broadcast slot for camera, stopping pipeline");
                return StreamExit::Halt;
            }

            if failed && self.record_failure() {
                return StreamExit::Reconnect;
            }
        }
    }

    /// Counts one per-frame failure; true when the limit forces a reconnect.
    fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.settings.max_consecutive_failures {
            warn!(
                camera_id = self.camera.id,
                failures = self.consecutive_failures,
                "too many consecutive frame failures, forcing reconnect"
            );
            return true;
        }
        false
    }

    /// Detect, annotate and encode one frame on the blocking pool.
    async fn process(&self, frame: RawFrame) -> Result<ProcessedFrame, PipelineError> {
        let adapter = Arc::clone(&self.adapter);
        let annotator = self.annotator.clone();
        let filter = Arc::clone(&self.filter);
        let metrics = self.metrics.clone();
        let confidence_threshold = self.camera.detection_threshold;
        let nms_threshold = self.camera.nms_threshold;
        let quality = self.settings.jpeg_quality;

        tokio::task::spawn_blocking(move || -> Result<ProcessedFrame, PipelineError> {
            let mut frame = frame;
            let detected = adapter.lock().detect(&frame, confidence_threshold, nms_threshold);

            let (detections, match_count, detection_error) = match detected {
                Ok(detections) => {
                    let overlays = metrics.map(|m| m.current_metrics()).unwrap_or_default();
                    let count = annotator.annotate(&mut frame, &detections, &filter, &overlays);
                    (detections.len(), count, None)
                }
                Err(e) => (0, 0, Some(e)),
            };

            Ok(ProcessedFrame {
                frame: frame.encode_jpeg(quality)?,
                detections,
                match_count,
                detection_error,
            })
        })
        .await?
    }
}
