//! Error types for camwatch

use std::path::PathBuf;

use thiserror::Error;

use crate::config::CameraId;

/// Camera connection problems. Recovered inside the pipeline by reconnecting.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("camera source unavailable at {url}: {reason}")]
    Unavailable { url: String, reason: String },

    #[error("camera stream ended: {0}")]
    StreamEnded(String),

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),
}

/// A single failed inference call.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("frame has unsupported dimensions {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
}

/// Fatal at startup: the process must not serve with an unusable model.
#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("model artifact not found: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("class table is empty: {}", .0.display())]
    EmptyClassTable(PathBuf),

    #[error("detection backend error: {0}")]
    Backend(String),

    #[error("no detection backend compiled in (enable the `opencv` feature)")]
    BackendUnavailable,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("unknown camera id {0}")]
    UnknownCamera(CameraId),

    #[error("broadcast slot for camera {0} closed")]
    Closed(CameraId),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures while turning a raw frame into a published one.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),

    #[error("frame worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum CamwatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_display() {
        let err = SourceError::Unavailable {
            url: "http://labcam1.local:9081".to_string(),
            reason: "connection refused".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("labcam1.local"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_model_load_error_from_io() {
        let err = ModelLoadError::Io {
            path: PathBuf::from("coco.names"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("coco.names"));
    }

    #[test]
    fn test_umbrella_conversions() {
        let err: CamwatchError = BroadcastError::UnknownCamera(999).into();
        assert!(matches!(err, CamwatchError::Broadcast(BroadcastError::UnknownCamera(999))));

        let err: CamwatchError = ModelLoadError::BackendUnavailable.into();
        assert!(err.to_string().contains("opencv"));
    }
}
