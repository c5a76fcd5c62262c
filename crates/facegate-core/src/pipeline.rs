//! Per-frame recognition pipeline.
//!
//! Composes the quality gate, hold timer, identity matcher and liveness
//! challenge into a single frame-driven state machine. One pipeline
//! instance owns one logical session: single-threaded, no operation
//! suspends mid-frame, and timing transitions compare wall-clock
//! timestamps captured at state entry against `now` at each poll.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::hold::{HoldStatus, HoldTimer};
use crate::liveness::{Challenge, ChallengeAction, ChallengeStatus};
use crate::matcher::{MatchConfig, Matcher, NearestMatcher};
use crate::quality::{self, QualityConfig};
use crate::types::{Face, FaceEncoder, FaceLocator, FrameView, Gallery, Landmarker};

/// Pipeline tuning knobs. All durations are wall-clock.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub quality: QualityConfig,
    pub matching: MatchConfig,
    /// Minimum continuous qualifying presence before recognition.
    pub hold_duration: Duration,
    /// Window for completing a liveness challenge.
    pub challenge_timeout: Duration,
    /// Actions the challenge may draw from.
    pub actions: Vec<ChallengeAction>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quality: QualityConfig::default(),
            matching: MatchConfig::default(),
            hold_duration: Duration::from_secs(2),
            challenge_timeout: Duration::from_secs(5),
            actions: ChallengeAction::DEFAULT_SET.to_vec(),
        }
    }
}

/// Outcome of processing one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// No face detected, quality rejected, or a capability failed; the
    /// hold timer was reset.
    NoFace,
    /// Qualifying face present, hold not yet satisfied.
    Holding { remaining_secs: f32 },
    /// Hold satisfied but the gallery produced no unambiguous identity;
    /// recognition is retried on the next frame.
    Unrecognized,
    /// A liveness challenge is pending (possibly issued this frame).
    ChallengeActive { identity: String, prompt: String },
    /// Challenge confirmed this frame; identity verified live.
    Verified {
        identity: String,
        action: ChallengeAction,
    },
    /// Challenge window expired; the subject restarts from the hold phase.
    ChallengeTimedOut,
}

/// Frame-driven recognition pipeline over pluggable vision capabilities.
pub struct Pipeline<L, E, K> {
    locator: L,
    encoder: E,
    landmarker: K,
    matcher: NearestMatcher,
    gallery: Gallery,
    hold: HoldTimer,
    challenge: Option<Challenge>,
    cfg: PipelineConfig,
    rng: StdRng,
}

impl<L, E, K> Pipeline<L, E, K>
where
    L: FaceLocator,
    E: FaceEncoder,
    K: Landmarker,
{
    pub fn new(locator: L, encoder: E, landmarker: K, gallery: Gallery, cfg: PipelineConfig) -> Self {
        Self::with_rng(locator, encoder, landmarker, gallery, cfg, StdRng::from_entropy())
    }

    /// Construct with an explicit RNG (deterministic tests).
    pub fn with_rng(
        locator: L,
        encoder: E,
        landmarker: K,
        gallery: Gallery,
        cfg: PipelineConfig,
        rng: StdRng,
    ) -> Self {
        let matcher = NearestMatcher::new(cfg.matching.clone());
        let hold = HoldTimer::new(cfg.hold_duration);
        Self {
            locator,
            encoder,
            landmarker,
            matcher,
            gallery,
            hold,
            challenge: None,
            cfg,
            rng,
        }
    }

    /// Process one frame (already mirrored / contrast-corrected upstream).
    pub fn process_frame(&mut self, frame: FrameView<'_>, now: Instant) -> FrameOutcome {
        // An active challenge owns the session: no fresh detection, hold
        // or matching until it resolves.
        if self.challenge.is_some() {
            return self.drive_challenge(frame, now);
        }

        let faces = match self.locator.locate_faces(frame) {
            Ok(faces) => faces,
            Err(err) => {
                tracing::warn!(error = %err, "face location failed; treating as no detection");
                self.hold.reset();
                return FrameOutcome::NoFace;
            }
        };

        // Primary face only: the highest-confidence detection.
        let Some(face) = faces.into_iter().next() else {
            self.hold.reset();
            return FrameOutcome::NoFace;
        };

        if !quality::check(frame, &face.region, &self.cfg.quality) {
            self.hold.reset();
            return FrameOutcome::NoFace;
        }

        match self.hold.update(true, now) {
            HoldStatus::Idle => FrameOutcome::NoFace, // unreachable on a passing frame
            HoldStatus::Holding { remaining } => FrameOutcome::Holding {
                remaining_secs: remaining.as_secs_f32(),
            },
            HoldStatus::Satisfied => {
                let embedding = match self.encoder.encode_face(frame, &face) {
                    Ok(embedding) => embedding,
                    Err(err) => {
                        tracing::warn!(error = %err, "embedding failed; treating as no detection");
                        self.hold.reset();
                        return FrameOutcome::NoFace;
                    }
                };

                let Some(matched) = self.matcher.best_match(&embedding, &self.gallery) else {
                    tracing::debug!("hold satisfied but no unambiguous gallery match");
                    return FrameOutcome::Unrecognized;
                };

                tracing::info!(
                    identity = %matched.name,
                    distance = matched.distance,
                    "identity provisionally recognized"
                );

                // Advancing to the challenge phase consumes the hold.
                self.hold.reset();
                let challenge = Challenge::issue(
                    &mut self.rng,
                    &self.cfg.actions,
                    matched.name,
                    face.region,
                    now,
                    self.cfg.challenge_timeout,
                );
                let outcome = FrameOutcome::ChallengeActive {
                    identity: challenge.identity().to_string(),
                    prompt: challenge.prompt(),
                };
                self.challenge = Some(challenge);
                outcome
            }
        }
    }

    /// Evaluate the active challenge for this frame. Landmarks are taken at
    /// the region captured when the challenge began.
    fn drive_challenge(&mut self, frame: FrameView<'_>, now: Instant) -> FrameOutcome {
        let challenge = self
            .challenge
            .as_mut()
            .expect("drive_challenge called without an active challenge");

        // Timeout applies even when landmark extraction fails below.
        if challenge.timed_out(now) {
            let challenge = self.challenge.take().expect("challenge present");
            tracing::info!(identity = %challenge.identity(), "liveness challenge timed out");
            return FrameOutcome::ChallengeTimedOut;
        }

        let landmarks = match self.landmarker.landmarks(frame, challenge.region()) {
            Ok(landmarks) => landmarks,
            Err(err) => {
                // Best-effort per frame: keep the prompt up and retry.
                tracing::debug!(error = %err, "landmark extraction failed during challenge");
                return FrameOutcome::ChallengeActive {
                    identity: challenge.identity().to_string(),
                    prompt: challenge.prompt(),
                };
            }
        };

        match challenge.evaluate(&landmarks, now) {
            ChallengeStatus::Confirmed => {
                let challenge = self.challenge.take().expect("challenge present");
                tracing::info!(
                    identity = %challenge.identity(),
                    action = %challenge.action(),
                    "liveness confirmed"
                );
                FrameOutcome::Verified {
                    identity: challenge.identity().to_string(),
                    action: challenge.action(),
                }
            }
            ChallengeStatus::TimedOut => {
                self.challenge = None;
                FrameOutcome::ChallengeTimedOut
            }
            ChallengeStatus::Pending => FrameOutcome::ChallengeActive {
                identity: challenge.identity().to_string(),
                prompt: challenge.prompt(),
            },
        }
    }

    /// Abort the active challenge, if any (synchronous, e.g. on exit).
    pub fn cancel_challenge(&mut self) {
        if let Some(challenge) = self.challenge.take() {
            tracing::info!(identity = %challenge.identity(), "liveness challenge cancelled");
        }
    }

    pub fn challenge_active(&self) -> bool {
        self.challenge.is_some()
    }

    /// Replace the gallery (explicit reload between frames).
    pub fn set_gallery(&mut self, gallery: Gallery) {
        tracing::info!(entries = gallery.len(), "gallery reloaded");
        self.gallery = gallery;
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Encode the primary face of a still frame, bypassing the session
    /// state machine. Used for enrollment from reference images.
    pub fn encode_frame(
        &mut self,
        frame: FrameView<'_>,
    ) -> Result<Option<crate::types::Embedding>, crate::types::CapabilityError> {
        let faces = self.locator.locate_faces(frame)?;
        let Some(face) = faces.into_iter().next() else {
            return Ok(None);
        };
        self.encoder.encode_face(frame, &face).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::fixtures;
    use crate::types::{
        CapabilityError, Embedding, Face, FaceRegion, GalleryEntry, Landmarks, LANDMARK_COUNT,
    };

    const W: u32 = 320;
    const H: u32 = 240;

    /// High-contrast frame so the quality gate passes for any sizable region.
    fn frame_data() -> Vec<u8> {
        let mut data = vec![10u8; (W * H) as usize];
        for y in 0..H {
            for x in W / 2..W {
                data[(y * W + x) as usize] = 200;
            }
        }
        data
    }

    fn region() -> FaceRegion {
        FaceRegion::new(60, 220, 180, 100)
    }

    fn face() -> Face {
        Face::from_region(region())
    }

    struct ScriptedLocator {
        responses: Vec<Result<Vec<Face>, CapabilityError>>,
        calls: usize,
    }

    impl ScriptedLocator {
        fn always_found() -> Self {
            Self {
                responses: Vec::new(),
                calls: 0,
            }
        }

        fn scripted(responses: Vec<Result<Vec<Face>, CapabilityError>>) -> Self {
            Self { responses, calls: 0 }
        }
    }

    impl FaceLocator for ScriptedLocator {
        fn locate_faces(&mut self, _frame: FrameView<'_>) -> Result<Vec<Face>, CapabilityError> {
            let i = self.calls;
            self.calls += 1;
            match self.responses.get_mut(i) {
                // Default script: the same face every frame.
                None => Ok(vec![face()]),
                Some(slot) => std::mem::replace(slot, Ok(vec![])),
            }
        }
    }

    struct FixedEncoder {
        embedding: Embedding,
        calls: usize,
    }

    impl FixedEncoder {
        fn new(values: Vec<f32>) -> Self {
            Self {
                embedding: Embedding {
                    values,
                    model_version: None,
                },
                calls: 0,
            }
        }
    }

    impl FaceEncoder for FixedEncoder {
        fn encode_face(
            &mut self,
            _frame: FrameView<'_>,
            _face: &Face,
        ) -> Result<Embedding, CapabilityError> {
            self.calls += 1;
            Ok(self.embedding.clone())
        }
    }

    struct ScriptedLandmarker {
        frames: Vec<[(f32, f32); LANDMARK_COUNT]>,
        calls: usize,
    }

    impl Landmarker for ScriptedLandmarker {
        fn landmarks(
            &mut self,
            _frame: FrameView<'_>,
            _region: &FaceRegion,
        ) -> Result<Landmarks, CapabilityError> {
            let i = self.calls.min(self.frames.len().saturating_sub(1));
            self.calls += 1;
            Ok(Landmarks::new(self.frames[i]))
        }
    }

    fn alice_gallery() -> Gallery {
        // Probe distance to ALICE ≈ 0.05, well under the 0.45 threshold.
        Gallery::new(vec![GalleryEntry {
            name: "ALICE".into(),
            embedding: Embedding {
                values: vec![0.05, 0.0],
                model_version: None,
            },
        }])
    }

    fn blink_only_config() -> PipelineConfig {
        PipelineConfig {
            actions: vec![ChallengeAction::Blink],
            ..PipelineConfig::default()
        }
    }

    fn pipeline_with(
        locator: ScriptedLocator,
        landmark_frames: Vec<[(f32, f32); LANDMARK_COUNT]>,
        cfg: PipelineConfig,
    ) -> Pipeline<ScriptedLocator, FixedEncoder, ScriptedLandmarker> {
        Pipeline::with_rng(
            locator,
            FixedEncoder::new(vec![0.0, 0.0]),
            ScriptedLandmarker {
                frames: landmark_frames,
                calls: 0,
            },
            alice_gallery(),
            cfg,
            StdRng::seed_from_u64(7),
        )
    }

    fn secs(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn test_no_face_when_nothing_detected() {
        let mut p = pipeline_with(
            ScriptedLocator::scripted(vec![Ok(vec![])]),
            vec![fixtures::neutral()],
            blink_only_config(),
        );
        let data = frame_data();
        let frame = FrameView::new(&data, W, H);
        assert_eq!(p.process_frame(frame, Instant::now()), FrameOutcome::NoFace);
    }

    #[test]
    fn test_capability_failure_degrades_to_no_face_and_resets_hold() {
        let t0 = Instant::now();
        let mut p = pipeline_with(
            ScriptedLocator::scripted(vec![
                Ok(vec![face()]),
                Err(CapabilityError::Backend("inference failed".into())),
                Ok(vec![face()]),
            ]),
            vec![fixtures::neutral()],
            blink_only_config(),
        );
        let data = frame_data();
        let frame = FrameView::new(&data, W, H);

        assert!(matches!(
            p.process_frame(frame, t0),
            FrameOutcome::Holding { .. }
        ));
        assert_eq!(p.process_frame(frame, t0 + secs(1000)), FrameOutcome::NoFace);
        // Hold restarted from scratch after the failure
        match p.process_frame(frame, t0 + secs(2000)) {
            FrameOutcome::Holding { remaining_secs } => {
                assert!((remaining_secs - 2.0).abs() < 0.01)
            }
            other => panic!("expected fresh Holding, got {other:?}"),
        }
    }

    #[test]
    fn test_quality_rejection_resets_hold() {
        // A 20x20 region fails the 50 px minimum.
        let tiny = Face::from_region(FaceRegion::new(10, 30, 30, 10));
        let t0 = Instant::now();
        let mut p = pipeline_with(
            ScriptedLocator::scripted(vec![Ok(vec![face()]), Ok(vec![tiny])]),
            vec![fixtures::neutral()],
            blink_only_config(),
        );
        let data = frame_data();
        let frame = FrameView::new(&data, W, H);

        assert!(matches!(
            p.process_frame(frame, t0),
            FrameOutcome::Holding { .. }
        ));
        assert_eq!(p.process_frame(frame, t0 + secs(500)), FrameOutcome::NoFace);
    }

    #[test]
    fn test_hold_then_challenge_then_verified() {
        // Blink appears on the landmark frame evaluated after the challenge
        // is issued.
        let mut blink = fixtures::neutral();
        fixtures::set_eye(&mut blink, 36, 75.0, 0.15);

        let t0 = Instant::now();
        let mut p = pipeline_with(
            ScriptedLocator::always_found(),
            vec![blink],
            blink_only_config(),
        );
        let data = frame_data();
        let frame = FrameView::new(&data, W, H);

        // Frames at 0s and 1s: holding.
        assert!(matches!(
            p.process_frame(frame, t0),
            FrameOutcome::Holding { .. }
        ));
        assert!(matches!(
            p.process_frame(frame, t0 + secs(1000)),
            FrameOutcome::Holding { .. }
        ));

        // 2.2s: hold satisfied, match found, challenge issued on the same
        // frame; no frame is skipped between hold and prompt.
        match p.process_frame(frame, t0 + secs(2200)) {
            FrameOutcome::ChallengeActive { identity, prompt } => {
                assert_eq!(identity, "ALICE");
                assert_eq!(prompt, "ALICE, please blink");
            }
            other => panic!("expected ChallengeActive, got {other:?}"),
        }
        assert!(p.challenge_active());

        // Next frame: blink landmarks confirm.
        assert_eq!(
            p.process_frame(frame, t0 + secs(3200)),
            FrameOutcome::Verified {
                identity: "ALICE".into(),
                action: ChallengeAction::Blink,
            }
        );
        assert!(!p.challenge_active());
    }

    #[test]
    fn test_challenge_timeout_resets_to_detection() {
        let t0 = Instant::now();
        let mut p = pipeline_with(
            ScriptedLocator::always_found(),
            vec![fixtures::neutral()],
            blink_only_config(),
        );
        let data = frame_data();
        let frame = FrameView::new(&data, W, H);

        p.process_frame(frame, t0);
        match p.process_frame(frame, t0 + secs(2100)) {
            FrameOutcome::ChallengeActive { .. } => {}
            other => panic!("expected ChallengeActive, got {other:?}"),
        }

        // No blink for >5s after challenge start: timed out.
        assert!(matches!(
            p.process_frame(frame, t0 + secs(4000)),
            FrameOutcome::ChallengeActive { .. }
        ));
        assert_eq!(
            p.process_frame(frame, t0 + secs(7300)),
            FrameOutcome::ChallengeTimedOut
        );
        assert!(!p.challenge_active());

        // The subject must be re-recognized from the hold phase.
        match p.process_frame(frame, t0 + secs(7400)) {
            FrameOutcome::Holding { remaining_secs } => {
                assert!((remaining_secs - 2.0).abs() < 0.01)
            }
            other => panic!("expected Holding, got {other:?}"),
        }
    }

    #[test]
    fn test_unrecognized_keeps_hold_satisfied() {
        let t0 = Instant::now();
        let mut p = Pipeline::with_rng(
            ScriptedLocator::always_found(),
            // Probe far from every gallery entry.
            FixedEncoder::new(vec![5.0, 5.0]),
            ScriptedLandmarker {
                frames: vec![fixtures::neutral()],
                calls: 0,
            },
            alice_gallery(),
            blink_only_config(),
            StdRng::seed_from_u64(7),
        );
        let data = frame_data();
        let frame = FrameView::new(&data, W, H);

        p.process_frame(frame, t0);
        assert_eq!(
            p.process_frame(frame, t0 + secs(2100)),
            FrameOutcome::Unrecognized
        );
        // Hold stays satisfied; recognition is retried on the next frame.
        assert_eq!(
            p.process_frame(frame, t0 + secs(3100)),
            FrameOutcome::Unrecognized
        );
        assert!(!p.challenge_active());
    }

    #[test]
    fn test_cancel_challenge() {
        let t0 = Instant::now();
        let mut p = pipeline_with(
            ScriptedLocator::always_found(),
            vec![fixtures::neutral()],
            blink_only_config(),
        );
        let data = frame_data();
        let frame = FrameView::new(&data, W, H);

        p.process_frame(frame, t0);
        p.process_frame(frame, t0 + secs(2100));
        assert!(p.challenge_active());
        p.cancel_challenge();
        assert!(!p.challenge_active());
    }

    #[test]
    fn test_empty_gallery_never_verifies() {
        let t0 = Instant::now();
        let mut p = Pipeline::with_rng(
            ScriptedLocator::always_found(),
            FixedEncoder::new(vec![0.0, 0.0]),
            ScriptedLandmarker {
                frames: vec![fixtures::neutral()],
                calls: 0,
            },
            Gallery::default(),
            blink_only_config(),
            StdRng::seed_from_u64(7),
        );
        let data = frame_data();
        let frame = FrameView::new(&data, W, H);

        p.process_frame(frame, t0);
        assert_eq!(
            p.process_frame(frame, t0 + secs(2100)),
            FrameOutcome::Unrecognized
        );
    }

    #[test]
    fn test_encode_frame_for_enrollment() {
        let mut p = pipeline_with(
            ScriptedLocator::scripted(vec![Ok(vec![face()]), Ok(vec![])]),
            vec![fixtures::neutral()],
            blink_only_config(),
        );
        let data = frame_data();
        let frame = FrameView::new(&data, W, H);

        let embedding = p.encode_frame(frame).unwrap();
        assert_eq!(embedding.unwrap().values, vec![0.0, 0.0]);

        // Second scripted response has no face.
        assert!(p.encode_frame(frame).unwrap().is_none());
    }

    #[test]
    fn test_end_to_end_single_mark() {
        // One gallery entry ALICE; three qualifying frames satisfy the 2s
        // hold; the blink challenge confirms on the next frame; exactly
        // one Verified outcome is emitted.
        let mut blink = fixtures::neutral();
        fixtures::set_eye(&mut blink, 42, 105.0, 0.15);

        let t0 = Instant::now();
        let mut p = pipeline_with(
            ScriptedLocator::always_found(),
            vec![blink],
            blink_only_config(),
        );
        let data = frame_data();
        let frame = FrameView::new(&data, W, H);

        let mut verified = Vec::new();
        for (i, ms) in [0u64, 1000, 2100, 3100, 4100].iter().enumerate() {
            let outcome = p.process_frame(frame, t0 + secs(*ms));
            if let FrameOutcome::Verified { identity, .. } = &outcome {
                verified.push((i, identity.clone()));
            }
        }

        assert_eq!(verified, vec![(3, "ALICE".to_string())]);
    }
}
