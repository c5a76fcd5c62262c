//! 68-point facial landmark model via ONNX Runtime.
//!
//! Uses the insightface 1k3d68 model: a square crop around the detected
//! region is resized to 192x192, and the network regresses 68 points in
//! the Multi-PIE ordering (eyes 36-47, nose tip 30, mouth 48-67) that the
//! challenge checks expect. The model emits 3D points; the z component is
//! discarded.

use crate::util;
use facegate_core::{CapabilityError, FaceRegion, FrameView, Landmarker, Landmarks, LANDMARK_COUNT};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: usize = 192;
/// The model is trained on raw pixel values.
const LANDMARK_MEAN: f32 = 0.0;
const LANDMARK_STD: f32 = 1.0;
/// Crop expansion around the region so the whole face fits the input.
const LANDMARK_CROP_MARGIN: f32 = 1.5;
/// 68 points, (x, y, z) each.
const LANDMARK_OUTPUT_LEN: usize = LANDMARK_COUNT * 3;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region is empty")]
    EmptyRegion,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// 68-point landmark extractor.
pub struct FaceLandmarker {
    session: Session,
}

impl FaceLandmarker {
    /// Load the landmark ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, LandmarkError> {
        if !model_path.exists() {
            return Err(LandmarkError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded landmark model");

        Ok(Self { session })
    }

    /// Regress 68 full-frame landmark points for a detected face region.
    pub fn extract(
        &mut self,
        frame: FrameView<'_>,
        region: &FaceRegion,
    ) -> Result<Landmarks, LandmarkError> {
        if region.is_empty() {
            return Err(LandmarkError::EmptyRegion);
        }

        let cx = (region.left + region.right) as f32 / 2.0;
        let cy = (region.top + region.bottom) as f32 / 2.0;
        let crop_size = region.width().max(region.height()) as f32 * LANDMARK_CROP_MARGIN;

        let crop = util::square_crop(
            frame.data,
            frame.width as usize,
            frame.height as usize,
            cx,
            cy,
            crop_size,
        );
        let crop_side = crop_size.round().max(1.0) as usize;
        let resized = util::bilinear_resize(
            &crop,
            crop_side,
            crop_side,
            LANDMARK_INPUT_SIZE,
            LANDMARK_INPUT_SIZE,
        );

        let input: Array4<f32> =
            util::nchw_from_gray(&resized, LANDMARK_INPUT_SIZE, LANDMARK_MEAN, LANDMARK_STD);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("landmark regression: {e}")))?;

        if raw.len() < LANDMARK_OUTPUT_LEN {
            return Err(LandmarkError::InferenceFailed(format!(
                "expected {LANDMARK_OUTPUT_LEN} landmark values, got {}",
                raw.len()
            )));
        }

        let crop_origin = (cx - crop_size / 2.0, cy - crop_size / 2.0);
        let points = map_output_points(raw, crop_origin, crop_size);

        Ok(Landmarks::new(points))
    }
}

impl Landmarker for FaceLandmarker {
    fn landmarks(
        &mut self,
        frame: FrameView<'_>,
        region: &FaceRegion,
    ) -> Result<Landmarks, CapabilityError> {
        match self.extract(frame, region) {
            Ok(landmarks) => Ok(landmarks),
            Err(LandmarkError::EmptyRegion) => {
                Err(CapabilityError::BadInput("empty face region".into()))
            }
            Err(e) => Err(CapabilityError::Backend(e.to_string())),
        }
    }
}

/// Map raw model outputs to full-frame coordinates.
///
/// The network emits (x, y, z) per point in [-1, 1] relative to the input
/// square; x and y map to `(v + 1) * input_size / 2` in crop space, then
/// scale back to the frame.
fn map_output_points(
    raw: &[f32],
    crop_origin: (f32, f32),
    crop_size: f32,
) -> [(f32, f32); LANDMARK_COUNT] {
    let half = LANDMARK_INPUT_SIZE as f32 / 2.0;
    let crop_scale = crop_size / LANDMARK_INPUT_SIZE as f32;

    let mut points = [(0.0f32, 0.0f32); LANDMARK_COUNT];
    for (i, point) in points.iter_mut().enumerate() {
        let px = (raw[i * 3] + 1.0) * half;
        let py = (raw[i * 3 + 1] + 1.0) * half;
        *point = (
            crop_origin.0 + px * crop_scale,
            crop_origin.1 + py * crop_scale,
        );
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_centered_point() {
        // Output 0.0 maps to the center of the crop
        let raw = vec![0.0f32; LANDMARK_OUTPUT_LEN];
        let points = map_output_points(&raw, (100.0, 50.0), 192.0);
        for &(x, y) in &points {
            assert!((x - 196.0).abs() < 1e-3);
            assert!((y - 146.0).abs() < 1e-3);
        }
    }

    #[test]
    fn map_corner_points() {
        // -1 maps to the crop origin, +1 to the far edge
        let mut raw = vec![0.0f32; LANDMARK_OUTPUT_LEN];
        raw[0] = -1.0;
        raw[1] = -1.0;
        raw[3] = 1.0;
        raw[4] = 1.0;

        let points = map_output_points(&raw, (10.0, 20.0), 100.0);
        assert!((points[0].0 - 10.0).abs() < 1e-3);
        assert!((points[0].1 - 20.0).abs() < 1e-3);
        assert!((points[1].0 - 110.0).abs() < 1e-3);
        assert!((points[1].1 - 120.0).abs() < 1e-3);
    }

    #[test]
    fn map_scales_with_crop_size() {
        // Same normalized output, twice the crop size, twice the offset
        let mut raw = vec![0.0f32; LANDMARK_OUTPUT_LEN];
        raw[0] = 0.5;
        raw[1] = 0.5;

        let small = map_output_points(&raw, (0.0, 0.0), 100.0);
        let large = map_output_points(&raw, (0.0, 0.0), 200.0);
        assert!((large[0].0 - small[0].0 * 2.0).abs() < 1e-3);
        assert!((large[0].1 - small[0].1 * 2.0).abs() < 1e-3);
    }
}
