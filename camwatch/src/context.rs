// THEORY:
// `AppContext` replaces process-wide globals. It is built once from the parsed
// configuration and owns everything the camera pipelines share: the class table,
// the overlay font, the broadcaster and the optional metrics source.
//
// Startup is two-phase. `spawn_pipelines` first loads one detector per camera and
// only spawns tasks once every load has succeeded, so a bad model file stops the
// process before any camera is touched.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broadcast::LatestFrameBroadcaster;
use crate::config::{AppConfig, CameraConfig, CameraId};
use crate::core_modules::annotator::FrameAnnotator;
use crate::core_modules::class_table::ClassTable;
use crate::detection::{DetectionAdapter, ObjectDetector};
use crate::error::ModelLoadError;
use crate::metrics::{MetricsSource, SystemMetrics};
use crate::pipeline::{CameraPipeline, PipelineState};
use crate::source::CameraSource;

pub struct AppContext {
    config: AppConfig,
    classes: Arc<ClassTable>,
    annotator: FrameAnnotator,
    broadcaster: LatestFrameBroadcaster,
    metrics: Option<Arc<dyn MetricsSource>>,
}

impl AppContext {
    /// Loads the class table and font named by the configuration.
    pub fn from_config(config: AppConfig) -> Result<Self, ModelLoadError> {
        let classes = ClassTable::from_file(&config.model.class_names_path)?;
        info!(classes = classes.len(), path = %config.model.class_names_path.display(), "class table loaded");

        let annotator = FrameAnnotator::with_font_path(config.pipeline.font_path.as_deref());
        let metrics: Option<Arc<dyn MetricsSource>> = if config.pipeline.system_metrics {
            Some(Arc::new(SystemMetrics::new()))
        } else {
            None
        };

        Ok(Self::new(config, classes, annotator).with_metrics_source(metrics))
    }

    /// Builds a context from already loaded parts; no file access.
    pub fn new(config: AppConfig, classes: ClassTable, annotator: FrameAnnotator) -> Self {
        warn_unknown_classes(&config.cameras, &classes);
        let broadcaster = LatestFrameBroadcaster::new(config.cameras.iter().map(|c| c.id));
        Self {
            config,
            classes: Arc::new(classes),
            annotator,
            broadcaster,
            metrics: None,
        }
    }

    pub fn with_metrics(self, metrics: Arc<dyn MetricsSource>) -> Self {
        self.with_metrics_source(Some(metrics))
    }

    fn with_metrics_source(mut self, metrics: Option<Arc<dyn MetricsSource>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn broadcaster(&self) -> &LatestFrameBroadcaster {
        &self.broadcaster
    }

    /// Loads a detector for every camera, then starts one pipeline task each.
    ///
    /// Nothing is spawned if any load fails.
    pub fn spawn_pipelines<L>(
        &self,
        source: Arc<dyn CameraSource>,
        mut loader: L,
        shutdown: watch::Receiver<bool>,
    ) -> Result<PipelineSet, ModelLoadError>
    where
        L: FnMut(&CameraConfig) -> Result<Box<dyn ObjectDetector>, ModelLoadError>,
    {
        let mut pipelines = Vec::with_capacity(self.config.cameras.len());
        for camera in &self.config.cameras {
            let detector = loader(camera)?;
            let adapter = DetectionAdapter::new(detector, Arc::clone(&self.classes));
            let mut pipeline = CameraPipeline::new(
                camera.clone(),
                self.config.pipeline.clone(),
                Arc::clone(&source),
                adapter,
                self.broadcaster.clone(),
            )
            .with_annotator(self.annotator.clone());
            if let Some(metrics) = &self.metrics {
                pipeline = pipeline.with_metrics(Arc::clone(metrics));
            }
            pipelines.push(pipeline);
        }

        let mut set = PipelineSet::default();
        for pipeline in pipelines {
            let camera_id = pipeline.camera_id();
            set.states.insert(camera_id, pipeline.state());
            set.handles.push((camera_id, tokio::spawn(pipeline.run(shutdown.clone()))));
        }
        info!(cameras = set.handles.len(), "camera pipelines spawned");
        Ok(set)
    }
}

fn warn_unknown_classes(cameras: &[CameraConfig], classes: &ClassTable) {
    for camera in cameras {
        if camera.watched_classes.is_empty() {
            info!(camera_id = camera.id, "no watched classes configured, drawing every class");
        }
        let named = camera.watched_classes.iter().chain(camera.counted_class.iter());
        for name in named.filter(|name| !classes.contains(name)) {
            warn!(camera_id = camera.id, class = %name, "configured class is not in the class table");
        }
    }
}

/// Handles to the running pipelines.
#[derive(Default)]
pub struct PipelineSet {
    states: HashMap<CameraId, watch::Receiver<PipelineState>>,
    handles: Vec<(CameraId, JoinHandle<()>)>,
}

impl PipelineSet {
    pub fn states(&self) -> HashMap<CameraId, watch::Receiver<PipelineState>> {
        self.states.clone()
    }

    pub fn state(&self, camera_id: CameraId) -> Option<PipelineState> {
        self.states.get(&camera_id).map(|rx| *rx.borrow())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every pipeline task to finish.
    pub async fn join(self) {
        for (camera_id, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!(camera_id, error = %e, "pipeline task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, PipelineSettings, ServerSection, SourceConfig};
    use std::path::PathBuf;

    fn config() -> AppConfig {
        let mut cam1 = CameraConfig::new(1, "http://labcam1.local:9081");
        cam1.watched_classes.insert("person".to_string());
        cam1.counted_class = Some("person".to_string());
        let mut cam2 = CameraConfig::new(2, "http://labcam2.local:9081");
        cam2.watched_classes.insert("unicorn".to_string());
        AppConfig {
            server: ServerSection::default(),
            model: ModelConfig {
                weights_path: PathBuf::from("w.pb"),
                config_path: PathBuf::from("c.pbtxt"),
                class_names_path: PathBuf::from("/nonexistent/coco.names"),
                input_width: 320,
                input_height: 320,
                input_scale: 1.0 / 127.5,
                input_mean: [127.5; 3],
                swap_rb: true,
            },
            source: SourceConfig::default(),
            pipeline: PipelineSettings::default(),
            cameras: vec![cam1, cam2],
        }
    }

    #[test]
    fn test_new_creates_one_slot_per_camera() {
        let ctx = AppContext::new(config(), ClassTable::new(["person"]), FrameAnnotator::default());
        assert_eq!(ctx.broadcaster().camera_ids(), vec![1, 2]);
        assert_eq!(ctx.classes().len(), 1);
    }

    #[test]
    fn test_from_config_requires_class_table() {
        let err = AppContext::from_config(config()).err().unwrap();
        assert!(matches!(err, ModelLoadError::Io { .. }));
    }

    #[test]
    fn test_from_config_reads_class_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"person\nbicycle\n").unwrap();
        let mut config = config();
        config.model.class_names_path = file.path().to_path_buf();
        config.pipeline.system_metrics = false;

        let ctx = AppContext::from_config(config).unwrap();
        assert_eq!(ctx.classes().resolve(2), Some("bicycle"));
    }
}
