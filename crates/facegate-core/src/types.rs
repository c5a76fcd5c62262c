use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Face embedding vector (512-dimensional for the ArcFace backend).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute Euclidean distance between two embeddings.
    ///
    /// Gallery entries and probes are L2-normalized by the encoder, so the
    /// distance falls in [0, 2]. Lower = more similar.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Bounding region of a detected face in full-frame pixel coordinates.
///
/// Valid only against the frame it was computed from; regions are
/// recomputed every frame and never tracked across frames (except for the
/// single region captured at challenge start).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl FaceRegion {
    pub fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }
}

/// A face located in a frame: bounding region plus the five alignment
/// keypoints (eye centers, nose tip, mouth corners) when the detection
/// backend provides them.
#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    pub region: FaceRegion,
    pub keypoints: Option<[(f32, f32); 5]>,
}

impl Face {
    /// A face known only by its bounding region.
    pub fn from_region(region: FaceRegion) -> Self {
        Self {
            region,
            keypoints: None,
        }
    }
}

/// Number of facial landmarks in the 68-point scheme.
pub const LANDMARK_COUNT: usize = 68;

// dlib 68-point index ranges.
const LEFT_EYE: std::ops::Range<usize> = 36..42;
const RIGHT_EYE: std::ops::Range<usize> = 42..48;
const MOUTH: std::ops::Range<usize> = 48..68;
const NOSE_TIP: usize = 30;

/// Ordered 68-point facial landmarks in full-frame pixel coordinates.
///
/// Index scheme: 0–16 jaw, 17–21 left brow, 22–26 right brow, 27–35 nose,
/// 36–41 left eye, 42–47 right eye, 48–67 mouth. Recomputed per
/// verification frame; never cached across frames.
#[derive(Debug, Clone)]
pub struct Landmarks {
    points: [(f32, f32); LANDMARK_COUNT],
}

impl Landmarks {
    pub fn new(points: [(f32, f32); LANDMARK_COUNT]) -> Self {
        Self { points }
    }

    /// Build from a slice; returns `None` unless exactly 68 points are given.
    pub fn from_slice(points: &[(f32, f32)]) -> Option<Self> {
        let points: [(f32, f32); LANDMARK_COUNT] = points.try_into().ok()?;
        Some(Self { points })
    }

    pub fn point(&self, idx: usize) -> (f32, f32) {
        self.points[idx]
    }

    /// Nose tip (point 30).
    pub fn nose_tip(&self) -> (f32, f32) {
        self.points[NOSE_TIP]
    }

    /// The six left-eye points (36–41).
    pub fn left_eye(&self) -> &[(f32, f32)] {
        &self.points[LEFT_EYE]
    }

    /// The six right-eye points (42–47).
    pub fn right_eye(&self) -> &[(f32, f32)] {
        &self.points[RIGHT_EYE]
    }

    /// The twenty mouth points (48–67).
    pub fn mouth(&self) -> &[(f32, f32)] {
        &self.points[MOUTH]
    }
}

/// Centroid of a set of points.
pub fn centroid(points: &[(f32, f32)]) -> (f32, f32) {
    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0f32, 0.0f32), |(sx, sy), (x, y)| (sx + x, sy + y));
    (sx / n, sy / n)
}

/// Borrowed view of a grayscale frame (width × height bytes, row-major).
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> FrameView<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get((y * self.width + x) as usize).copied()
    }
}

/// One enrolled identity: name plus reference embedding.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub name: String,
    pub embedding: Embedding,
}

/// Ordered collection of enrolled identities.
///
/// Built once at session start; read-only during a recognition session.
/// Rebuilt on explicit reload, never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn push(&mut self, entry: GalleryEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Failure of an inference capability (detector, encoder, landmark net).
///
/// Distinct from "no face in frame": the pipeline logs capability failures
/// separately, then degrades to the same no-detection outcome for the
/// frame (recognition is best-effort and self-heals on the next frame).
#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("model backend failure: {0}")]
    Backend(String),
    #[error("frame unusable: {0}")]
    BadInput(String),
}

/// Locates faces in a frame.
pub trait FaceLocator {
    /// Returns detected faces ordered by decreasing confidence; an empty
    /// vector means no face this frame.
    fn locate_faces(&mut self, frame: FrameView<'_>) -> Result<Vec<Face>, CapabilityError>;
}

/// Produces an identity embedding for a located face.
pub trait FaceEncoder {
    fn encode_face(
        &mut self,
        frame: FrameView<'_>,
        face: &Face,
    ) -> Result<Embedding, CapabilityError>;
}

/// Extracts 68-point facial landmarks for a face region.
pub trait Landmarker {
    fn landmarks(
        &mut self,
        frame: FrameView<'_>,
        region: &FaceRegion,
    ) -> Result<Landmarks, CapabilityError>;
}
