//! OpenCV DNN detection backend (SSD-style `DetectionModel`).

use opencv::core::{Mat, Rect, Scalar, Size, Vector, CV_8UC3};
use opencv::dnn::DetectionModel;
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::ModelConfig;
use crate::core_modules::frame::{BoundingBox, RawDetection, RawFrame};
use crate::detection::ObjectDetector;
use crate::error::{DetectionError, ModelLoadError};

pub struct OpenCvDnnDetector {
    model: DetectionModel,
}

impl OpenCvDnnDetector {
    pub fn load(config: &ModelConfig) -> Result<Self, ModelLoadError> {
        let backend = |e: opencv::Error| ModelLoadError::Backend(e.to_string());

        let weights = config.weights_path.to_string_lossy();
        let graph = config.config_path.to_string_lossy();
        let mut model = DetectionModel::new(&weights, &graph).map_err(backend)?;

        let [b, g, r] = config.input_mean;
        model
            .set_input_size(Size::new(config.input_width as i32, config.input_height as i32))
            .map_err(backend)?;
        model.set_input_scale(Scalar::all(config.input_scale)).map_err(backend)?;
        model.set_input_mean(Scalar::new(b, g, r, 0.0)).map_err(backend)?;
        model.set_input_swap_rb(config.swap_rb).map_err(backend)?;

        Ok(Self { model })
    }
}

impl ObjectDetector for OpenCvDnnDetector {
    fn detect(
        &mut self,
        frame: &RawFrame,
        confidence_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Vec<RawDetection>, DetectionError> {
        let inference = |e: opencv::Error| DetectionError::Inference(e.to_string());

        // The model expects OpenCV's native BGR layout; swap_rb undoes it.
        let mut rgb = Mat::new_rows_cols_with_default(
            frame.height() as i32,
            frame.width() as i32,
            CV_8UC3,
            Scalar::all(0.0),
        )
        .map_err(inference)?;
        rgb.data_bytes_mut()
            .map_err(inference)?
            .copy_from_slice(frame.image().as_raw());
        let mut bgr = Mat::default();
        imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0).map_err(inference)?;

        let mut class_ids = Vector::<i32>::new();
        let mut confidences = Vector::<f32>::new();
        let mut boxes = Vector::<Rect>::new();
        self.model
            .detect(
                &bgr,
                &mut class_ids,
                &mut confidences,
                &mut boxes,
                confidence_threshold,
                nms_threshold,
            )
            .map_err(inference)?;

        let detections = class_ids
            .iter()
            .zip(confidences.iter())
            .zip(boxes.iter())
            .map(|((class_id, confidence), rect)| {
                RawDetection::new(
                    BoundingBox::new(rect.x as f32, rect.y as f32, rect.width as f32, rect.height as f32),
                    class_id,
                    confidence,
                )
            })
            .collect();
        Ok(detections)
    }
}
