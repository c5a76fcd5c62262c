//! ArcFace face embedder via ONNX Runtime.
//!
//! Produces L2-normalized 512-dimensional embeddings from 112x112 face
//! crops using the w600k_r50 model. Two crop paths: a similarity-transform
//! alignment when the five detector keypoints are available (the usual
//! case), and a margin square crop when only a region is known.

use crate::util;
use facegate_core::{CapabilityError, Embedding, Face, FaceEncoder, FaceRegion, FrameView};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// Expansion applied around a bare region before the square crop, so the
/// crop covers roughly what keypoint alignment would.
const REGION_CROP_MARGIN: f32 = 1.25;

/// ArcFace reference keypoints for a 112x112 output.
const REFERENCE_KEYPOINTS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region is empty")]
    EmptyRegion,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face embedder.
pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded face embedding model");

        Ok(Self { session })
    }

    /// Extract an embedding from a face aligned via the five detector
    /// keypoints.
    pub fn extract_aligned(
        &mut self,
        frame: FrameView<'_>,
        keypoints: &[(f32, f32); 5],
    ) -> Result<Embedding, EmbedderError> {
        let matrix = estimate_similarity_transform(keypoints, &REFERENCE_KEYPOINTS_112);
        let aligned = warp_affine(
            frame.data,
            frame.width as usize,
            frame.height as usize,
            &matrix,
            ARCFACE_INPUT_SIZE,
        );
        self.embed_crop(&aligned)
    }

    /// Extract an embedding from a bare region via a margin square crop.
    pub fn extract_region(
        &mut self,
        frame: FrameView<'_>,
        region: &FaceRegion,
    ) -> Result<Embedding, EmbedderError> {
        if region.is_empty() {
            return Err(EmbedderError::EmptyRegion);
        }

        let cx = (region.left + region.right) as f32 / 2.0;
        let cy = (region.top + region.bottom) as f32 / 2.0;
        let side = region.width().max(region.height()) as f32 * REGION_CROP_MARGIN;

        let crop = util::square_crop(
            frame.data,
            frame.width as usize,
            frame.height as usize,
            cx,
            cy,
            side,
        );
        let crop_side = side.round().max(1.0) as usize;
        let resized = util::bilinear_resize(
            &crop,
            crop_side,
            crop_side,
            ARCFACE_INPUT_SIZE,
            ARCFACE_INPUT_SIZE,
        );
        self.embed_crop(&resized)
    }

    /// Run the model on a 112x112 crop and L2-normalize the output.
    fn embed_crop(&mut self, crop: &[u8]) -> Result<Embedding, EmbedderError> {
        let input: Array4<f32> =
            util::nchw_from_gray(crop, ARCFACE_INPUT_SIZE, ARCFACE_MEAN, ARCFACE_STD);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding {
            values,
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

impl FaceEncoder for FaceEmbedder {
    fn encode_face(
        &mut self,
        frame: FrameView<'_>,
        face: &Face,
    ) -> Result<Embedding, CapabilityError> {
        let result = match &face.keypoints {
            Some(keypoints) => self.extract_aligned(frame, keypoints),
            None => self.extract_region(frame, &face.region),
        };
        match result {
            Ok(embedding) => Ok(embedding),
            Err(EmbedderError::EmptyRegion) => {
                Err(CapabilityError::BadInput("empty face region".into()))
            }
            Err(e) => Err(CapabilityError::Backend(e.to_string())),
        }
    }
}

/// Estimate a 2x3 similarity transform (scale, rotation, translation) from
/// `src` keypoints to `dst` keypoints by least-squares.
///
/// Returns [a, -b, tx, b, a, ty] for the matrix
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Overdetermined system A * [a, b, tx, ty]^T = B; each point pair
    // contributes sx*a - sy*b + tx = dx and sy*a + sx*b + ty = dy.
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for i in 0..5 {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];

        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let x = solve_4x4(&ata, &atb);
    [x[0], -x[1], x[2], x[1], x[0], x[3]]
}

/// Solve a 4x4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Apply a 2x3 affine warp with bilinear interpolation. Out-of-bounds
/// pixels are filled with 0.
fn warp_affine(
    frame: &[u8],
    src_width: usize,
    src_height: usize,
    matrix: &[f32; 6],
    out_size: usize,
) -> Vec<u8> {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    // Invert the 2x2 part: M = [[a, -b], [b, a]], det = a^2 + b^2
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return vec![0u8; out_size * out_size];
    }
    let ia = a / det;
    let ib = b / det;

    let mut output = vec![0u8; out_size * out_size];

    for oy in 0..out_size {
        for ox in 0..out_size {
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let sample = |x: i32, y: i32| -> f32 {
                if x >= 0 && x < src_width as i32 && y >= 0 && y < src_height as i32 {
                    frame[y as usize * src_width + x as usize] as f32
                } else {
                    0.0
                }
            };

            let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0) * fx * (1.0 - fy)
                + sample(x0, y0 + 1) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1) * fx * fy;

            output[oy * out_size + ox] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    output
}
