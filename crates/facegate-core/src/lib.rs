//! facegate-core: liveness-gated face recognition pipeline.
//!
//! Turns raw camera frames into verified employee identities: quality
//! gating, temporal hold debouncing, nearest-neighbor identity matching
//! with an ambiguity margin, and a randomized liveness challenge evaluated
//! against 68-point facial landmarks.

pub mod gallery;
pub mod hold;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod types;

pub use hold::{HoldStatus, HoldTimer};
pub use liveness::{Challenge, ChallengeAction, ChallengeStatus};
pub use matcher::{Match, MatchConfig, Matcher, NearestMatcher};
pub use pipeline::{FrameOutcome, Pipeline, PipelineConfig};
pub use quality::QualityConfig;
pub use types::{
    CapabilityError, Embedding, Face, FaceEncoder, FaceLocator, FaceRegion, FrameView, Gallery,
    GalleryEntry, Landmarker, Landmarks, LANDMARK_COUNT,
};
