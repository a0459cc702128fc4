// THEORY:
// This file is the entry point for the `camwatch` library crate: the frame
// pipeline and multi-viewer streaming engine behind the camwatch server.
//
// The public surface follows the path a frame takes:
// `source` (acquire) -> `detection` (detect) -> `core_modules::annotator` (draw)
// -> `pipeline` (encode and publish) -> `broadcast` (fan out to viewers).
// `context` wires one pipeline per configured camera; `config`, `error` and
// `metrics` are the ambient pieces around it. HTTP lives in `camwatch_server`.

pub mod broadcast;
pub mod config;
pub mod context;
pub mod core_modules;
pub mod detection;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod source;

// Re-export key types for the public API.
pub use broadcast::{LatestFrameBroadcaster, PublishedFrame, ViewerSession};
pub use config::{AppConfig, CameraConfig, CameraId};
pub use context::{AppContext, PipelineSet};
pub use core_modules::annotator::{ClassFilter, FrameAnnotator};
pub use core_modules::class_table::ClassTable;
pub use core_modules::frame::{AnnotatedFrame, BoundingBox, Detection, RawDetection, RawFrame};
pub use detection::{load_detector, DetectionAdapter, ObjectDetector};
pub use error::{
    BroadcastError, CamwatchError, ConfigError, DetectionError, ModelLoadError, PipelineError,
    SourceError,
};
pub use metrics::{MetricsSource, SystemMetrics};
pub use pipeline::{wait_for_shutdown, CameraPipeline, PipelineState};
pub use source::{build_source, CameraSource, CameraStream};
