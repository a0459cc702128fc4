// THEORY:
// The detection layer separates the model from everything the pipeline needs to
// be true about the model's output.
//
// 1.  **ObjectDetector** is the opaque black box: given a frame and thresholds it
//     returns raw candidates with 1-indexed class ids. Backends live behind cargo
//     features; tests plug in closures.
// 2.  **DetectionAdapter** wraps one detector and the class table. Whatever the
//     backend returns, the adapter re-applies the confidence floor and class-aware
//     non-max suppression, then resolves class ids. A candidate whose id has no
//     entry in the table is logged and dropped; it never fails the frame.
// 3.  **load_detector** is the loader contract: paths in, ready detector or
//     `ModelLoadError` out. A load error is fatal at startup.

#[cfg(feature = "opencv")]
pub mod opencv_dnn;

use std::sync::Arc;

use tracing::warn;

use crate::config::ModelConfig;
use crate::core_modules::class_table::ClassTable;
use crate::core_modules::frame::{Detection, RawDetection, RawFrame};
use crate::core_modules::nms::non_max_suppression;
use crate::error::{DetectionError, ModelLoadError};

/// The detection model itself. One instance serves exactly one camera.
pub trait ObjectDetector: Send {
    fn detect(
        &mut self,
        frame: &RawFrame,
        confidence_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Vec<RawDetection>, DetectionError>;
}

impl<F> ObjectDetector for F
where
    F: FnMut(&RawFrame, f32, f32) -> Result<Vec<RawDetection>, DetectionError> + Send,
{
    fn detect(
        &mut self,
        frame: &RawFrame,
        confidence_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Vec<RawDetection>, DetectionError> {
        self(frame, confidence_threshold, nms_threshold)
    }
}

pub struct DetectionAdapter {
    model: Box<dyn ObjectDetector>,
    classes: Arc<ClassTable>,
}

impl DetectionAdapter {
    pub fn new(model: Box<dyn ObjectDetector>, classes: Arc<ClassTable>) -> Self {
        Self { model, classes }
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// Runs the model and returns resolved detections in the model's order.
    pub fn detect(
        &mut self,
        frame: &RawFrame,
        confidence_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Vec<Detection>, DetectionError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(DetectionError::InvalidFrame {
                width: frame.width(),
                height: frame.height(),
            });
        }

        let candidates: Vec<RawDetection> = self
            .model
            .detect(frame, confidence_threshold, nms_threshold)?
            .into_iter()
            .filter(|d| d.confidence.is_finite() && d.confidence >= confidence_threshold)
            .collect();

        let survivors = non_max_suppression(candidates, nms_threshold);

        let mut detections = Vec::with_capacity(survivors.len());
        for raw in survivors {
            match self.classes.resolve(raw.class_id) {
                Some(name) => detections.push(Detection {
                    bbox: raw.bbox,
                    class_id: raw.class_id,
                    class_name: name.to_string(),
                    confidence: raw.confidence.min(1.0),
                }),
                None => warn!(
                    class_id = raw.class_id,
                    sequence = frame.sequence(),
                    "dropping detection with unknown class id"
                ),
            }
        }
        Ok(detections)
    }
}

/// Builds the detector described by `[model]`.
pub fn load_detector(model: &ModelConfig) -> Result<Box<dyn ObjectDetector>, ModelLoadError> {
    for path in [&model.weights_path, &model.config_path] {
        if !path.exists() {
            return Err(ModelLoadError::MissingArtifact(path.clone()));
        }
    }

    #[cfg(feature = "opencv")]
    {
        let detector = opencv_dnn::OpenCvDnnDetector::load(model)?;
        Ok(Box::new(detector))
    }

    #[cfg(not(feature = "opencv"))]
    {
        Err(ModelLoadError::BackendUnavailable)
    }
}
