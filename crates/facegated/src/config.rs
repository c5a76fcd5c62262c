use std::path::PathBuf;
use std::time::Duration;

use facegate_core::{ChallengeAction, MatchConfig, PipelineConfig, QualityConfig};

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory of reference images imported when the store is empty.
    pub reference_dir: PathBuf,
    /// Euclidean distance above which a gallery entry never matches.
    pub distance_threshold: f32,
    /// Required gap between best and second-best distance.
    pub ambiguity_margin: f32,
    /// Minimum face width/height in pixels.
    pub min_face_size: u32,
    /// Minimum grayscale standard deviation inside the face region.
    pub min_contrast: f32,
    /// Continuous qualifying presence required before recognition.
    pub hold_secs: f32,
    /// Window for completing a liveness challenge.
    pub challenge_timeout_secs: f32,
    /// Detection cadence of the kiosk loop, in milliseconds.
    pub frame_interval_ms: u64,
    /// Warmup frames discarded at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Challenge actions the kiosk may issue.
    pub actions: Vec<ChallengeAction>,
    /// Detection model filename inside `model_dir`.
    pub detector_model: String,
    /// Embedding model filename inside `model_dir`.
    pub embedder_model: String,
    /// Landmark model filename inside `model_dir`.
    pub landmark_model: String,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = facegate_vision::default_model_dir();

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let reference_dir = std::env::var("FACEGATE_REFERENCE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("reference"));

        Self {
            camera_device: std::env::var("FACEGATE_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            db_path,
            reference_dir,
            distance_threshold: env_f32("FACEGATE_DISTANCE_THRESHOLD", 0.45),
            ambiguity_margin: env_f32("FACEGATE_AMBIGUITY_MARGIN", 0.1),
            min_face_size: env_u32("FACEGATE_MIN_FACE_SIZE", 50),
            min_contrast: env_f32("FACEGATE_MIN_CONTRAST", 30.0),
            hold_secs: env_f32("FACEGATE_HOLD_SECS", 2.0),
            challenge_timeout_secs: env_f32("FACEGATE_CHALLENGE_TIMEOUT_SECS", 5.0),
            frame_interval_ms: env_u64("FACEGATE_FRAME_INTERVAL_MS", 1000),
            warmup_frames: env_usize("FACEGATE_WARMUP_FRAMES", 4),
            actions: env_actions("FACEGATE_ACTIONS"),
            detector_model: env_string("FACEGATE_DETECTOR_MODEL", "det_10g.onnx"),
            embedder_model: env_string("FACEGATE_EMBEDDER_MODEL", "w600k_r50.onnx"),
            landmark_model: env_string("FACEGATE_LANDMARK_MODEL", "1k3d68.onnx"),
        }
    }

    /// Pipeline tuning derived from this configuration.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            quality: QualityConfig {
                min_face_size: self.min_face_size,
                min_contrast: self.min_contrast,
            },
            matching: MatchConfig {
                distance_threshold: self.distance_threshold,
                ambiguity_margin: self.ambiguity_margin,
            },
            hold_duration: Duration::from_secs_f32(self.hold_secs),
            challenge_timeout: Duration::from_secs_f32(self.challenge_timeout_secs),
            actions: self.actions.clone(),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    /// Path to the ArcFace embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedder_model)
    }

    /// Path to the 68-point landmark model.
    pub fn landmark_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.landmark_model)
    }

    /// Whether every configured model filename appears in the shipped
    /// manifest. Custom filenames have no known checksum to verify.
    pub fn uses_manifest_models(&self) -> bool {
        [&self.detector_model, &self.embedder_model, &self.landmark_model]
            .iter()
            .all(|name| facegate_vision::MODELS.iter().any(|m| m.name == name.as_str()))
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_filenames_default_and_override() {
        let defaults = Config::from_env();
        assert_eq!(defaults.detector_model_path().file_name().unwrap(), "det_10g.onnx");
        assert_eq!(defaults.embedder_model_path().file_name().unwrap(), "w600k_r50.onnx");
        assert_eq!(defaults.landmark_model_path().file_name().unwrap(), "1k3d68.onnx");
        assert!(defaults.uses_manifest_models());

        std::env::set_var("FACEGATE_DETECTOR_MODEL", "det_2.5g.onnx");
        std::env::set_var("FACEGATE_EMBEDDER_MODEL", "w600k_mbf.onnx");
        let overridden = Config::from_env();
        std::env::remove_var("FACEGATE_DETECTOR_MODEL");
        std::env::remove_var("FACEGATE_EMBEDDER_MODEL");

        assert_eq!(overridden.detector_model_path().file_name().unwrap(), "det_2.5g.onnx");
        assert_eq!(overridden.embedder_model_path().file_name().unwrap(), "w600k_mbf.onnx");
        assert_eq!(overridden.landmark_model_path().file_name().unwrap(), "1k3d68.onnx");
        assert!(!overridden.uses_manifest_models());
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse a comma-separated action list ("turn-left,blink"), falling back to
/// the default set on absence or any unrecognized name.
fn env_actions(key: &str) -> Vec<ChallengeAction> {
    let Ok(raw) = std::env::var(key) else {
        return ChallengeAction::DEFAULT_SET.to_vec();
    };

    let parsed: Result<Vec<ChallengeAction>, _> =
        raw.split(',').map(|s| s.trim().parse()).collect();

    match parsed {
        Ok(actions) if !actions.is_empty() => actions,
        _ => {
            tracing::warn!(value = %raw, "unparseable {key}, using default action set");
            ChallengeAction::DEFAULT_SET.to_vec()
        }
    }
}
