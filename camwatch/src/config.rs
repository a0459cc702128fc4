//! Configuration for camwatch
//!
//! The whole configuration is read once at startup from a TOML file and is
//! immutable for the lifetime of the process.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub type CameraId = u32;

/// Top-level configuration file layout.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    pub model: ModelConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Address the HTTP surface binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Detection model artifacts and input preprocessing.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub weights_path: PathBuf,
    pub config_path: PathBuf,
    /// Newline separated class names; line N is class id N.
    pub class_names_path: PathBuf,
    #[serde(default = "default_input_side")]
    pub input_width: u32,
    #[serde(default = "default_input_side")]
    pub input_height: u32,
    #[serde(default = "default_input_scale")]
    pub input_scale: f64,
    #[serde(default = "default_input_mean")]
    pub input_mean: [f64; 3],
    #[serde(default = "default_true")]
    pub swap_rb: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceBackend {
    /// Pure Rust reader for `multipart/x-mixed-replace` JPEG streams.
    Mjpeg,
    /// OpenCV `VideoCapture`, needs the `opencv` feature.
    Opencv,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_backend")]
    pub backend: SourceBackend,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// A camera that sends nothing for this long is treated as disconnected.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl SourceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Settings shared by every camera pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    /// Wait between failed connection attempts.
    #[serde(default = "default_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    /// Consecutive per-frame failures that force a reconnect cycle.
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// TrueType font used for overlay text.
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    /// Draw CPU and RAM usage onto every frame.
    #[serde(default = "default_true")]
    pub system_metrics: bool,
}

impl PipelineSettings {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: default_backoff_ms(),
            max_consecutive_failures: default_max_failures(),
            jpeg_quality: default_jpeg_quality(),
            font_path: None,
            system_metrics: true,
        }
    }
}

/// One network camera and how its detections are filtered and counted.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub id: CameraId,
    pub url: String,
    pub detection_threshold: f32,
    pub nms_threshold: f32,
    /// Classes that are drawn. Empty means every known class.
    #[serde(default)]
    pub watched_classes: BTreeSet<String>,
    /// Drawn detections of this class are counted into the overlay.
    #[serde(default)]
    pub counted_class: Option<String>,
    #[serde(default = "default_count_label")]
    pub count_label: String,
    /// Run detection on every Nth captured frame only.
    #[serde(default = "default_process_every")]
    pub process_every: u32,
}

impl CameraConfig {
    pub fn new(id: CameraId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            detection_threshold: 0.5,
            nms_threshold: 0.4,
            watched_classes: BTreeSet::new(),
            counted_class: None,
            count_label: default_count_label(),
            process_every: 1,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(format!("camera {}: {}", self.id, msg)));

        if self.url.trim().is_empty() {
            return invalid("url must not be empty".to_string());
        }
        if !(self.detection_threshold > 0.0 && self.detection_threshold <= 1.0) {
            return invalid(format!(
                "detection_threshold {} must be in (0, 1]",
                self.detection_threshold
            ));
        }
        if !(self.nms_threshold > 0.0 && self.nms_threshold <= 1.0) {
            return invalid(format!("nms_threshold {} must be in (0, 1]", self.nms_threshold));
        }
        if self.process_every == 0 {
            return invalid("process_every must be at least 1".to_string());
        }
        if let Some(counted) = &self.counted_class {
            if !self.watched_classes.is_empty() && !self.watched_classes.contains(counted) {
                return invalid(format!("counted class {counted:?} is not in watched_classes"));
            }
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cameras.is_empty() {
            return Err(ConfigError::Invalid("at least one camera must be configured".to_string()));
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id) {
                return Err(ConfigError::Invalid(format!("duplicate camera id {}", camera.id)));
            }
            camera.validate()?;
        }

        if self.pipeline.jpeg_quality == 0 || self.pipeline.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality {} must be between 1 and 100",
                self.pipeline.jpeg_quality
            )));
        }
        if self.pipeline.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if self.model.input_width == 0 || self.model.input_height == 0 {
            return Err(ConfigError::Invalid("model input size must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn camera(&self, id: CameraId) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == id)
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:5001".to_string()
}

fn default_input_side() -> u32 {
    320
}

fn default_input_scale() -> f64 {
    1.0 / 127.5
}

fn default_input_mean() -> [f64; 3] {
    [127.5, 127.5, 127.5]
}

fn default_true() -> bool {
    true
}

fn default_backend() -> SourceBackend {
    SourceBackend::Mjpeg
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_backoff_ms() -> u64 {
    2_000
}

fn default_max_failures() -> u32 {
    5
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_count_label() -> String {
    "Count".to_string()
}

fn default_process_every() -> u32 {
    1
}
