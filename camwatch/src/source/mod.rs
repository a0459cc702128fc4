// THEORY:
// A camera source is split in two halves so the pipeline can own the retry loop:
//
// 1.  **CameraSource** is the factory. `open` makes exactly one connection attempt
//     and reports `SourceError::Unavailable` on failure. It never retries and
//     never sleeps; backoff is the pipeline's decision.
// 2.  **CameraStream** is one live connection. `read_frame` yields the next decoded
//     frame. `StreamEnded` means the connection is gone and must be reopened;
//     `CorruptFrame` means one frame was bad but the connection may still be fine.
//
// A stream holds at most the frame currently being assembled. Dropping it closes
// the underlying connection.

pub mod mjpeg;
#[cfg(feature = "opencv")]
pub mod capture;

use std::sync::Arc;

use async_trait::async_trait;
use image::RgbImage;

use crate::config::{SourceBackend, SourceConfig};
use crate::error::{ConfigError, SourceError};

pub use mjpeg::MjpegHttpSource;
#[cfg(feature = "opencv")]
pub use capture::OpenCvSource;

#[async_trait]
pub trait CameraSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn CameraStream>, SourceError>;
}

#[async_trait]
pub trait CameraStream: Send {
    async fn read_frame(&mut self) -> Result<RgbImage, SourceError>;
}

/// Picks the source implementation named by `[source] backend`.
pub fn build_source(config: &SourceConfig) -> Result<Arc<dyn CameraSource>, ConfigError> {
    match config.backend {
        SourceBackend::Mjpeg => Ok(Arc::new(MjpegHttpSource::new(config)?)),
        #[cfg(feature = "opencv")]
        SourceBackend::Opencv => Ok(Arc::new(OpenCvSource::new())),
        #[cfg(not(feature = "opencv"))]
        SourceBackend::Opencv => Err(ConfigError::Invalid(
            "source backend `opencv` requires the `opencv` feature".to_string(),
        )),
    }
}
