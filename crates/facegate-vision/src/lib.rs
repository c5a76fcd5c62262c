//! ONNX model backends for the recognition pipeline.
//!
//! Provides the three capabilities the pipeline is generic over: SCRFD
//! detection, ArcFace embedding, and 68-point landmark regression, plus
//! the model manifest used to verify weights at startup.

pub mod detector;
pub mod embedder;
pub mod landmarks;
pub mod models;
mod util;

pub use detector::{Detection, DetectorError, FaceDetector};
pub use embedder::{EmbedderError, FaceEmbedder};
pub use landmarks::{FaceLandmarker, LandmarkError};
pub use models::{default_model_dir, verify_models_dir, ModelIntegrityError, MODELS};
