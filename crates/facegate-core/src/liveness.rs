//! Randomized liveness challenge evaluated on facial landmarks.
//!
//! A static photograph can pass recognition; it cannot turn its head,
//! blink or nod on command. Once an identity is provisionally recognized,
//! the pipeline issues one randomly chosen action and confirms it against
//! landmark-derived signals within a timeout window.

use std::str::FromStr;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::types::{centroid, FaceRegion, Landmarks};

/// Minimum nose-tip x offset from the eye midpoint for a head turn (px).
const HEAD_TURN_MIN_OFFSET: f32 = 10.0;
/// Eye-aspect-ratio below which an eye counts as closed.
const BLINK_EAR_MAX: f32 = 0.2;
/// Minimum nose-tip displacement between evaluated frames for a nod (px).
const NOD_MIN_MOVEMENT: f32 = 5.0;
/// Mouth height must exceed this fraction of mouth width for a smile.
const SMILE_HEIGHT_RATIO: f32 = 0.4;

/// A physical action the subject is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeAction {
    TurnLeft,
    TurnRight,
    Blink,
    Nod,
    Smile,
}

impl ChallengeAction {
    /// The default issued action set.
    pub const DEFAULT_SET: [ChallengeAction; 4] = [
        ChallengeAction::TurnLeft,
        ChallengeAction::TurnRight,
        ChallengeAction::Blink,
        ChallengeAction::Nod,
    ];

    /// Instruction text shown to the subject.
    pub fn instruction(&self) -> &'static str {
        match self {
            ChallengeAction::TurnLeft => "please turn your head to the left",
            ChallengeAction::TurnRight => "please turn your head to the right",
            ChallengeAction::Blink => "please blink",
            ChallengeAction::Nod => "please nod",
            ChallengeAction::Smile => "please smile",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChallengeAction::TurnLeft => "turn-left",
            ChallengeAction::TurnRight => "turn-right",
            ChallengeAction::Blink => "blink",
            ChallengeAction::Nod => "nod",
            ChallengeAction::Smile => "smile",
        }
    }
}

impl FromStr for ChallengeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "turn-left" => Ok(ChallengeAction::TurnLeft),
            "turn-right" => Ok(ChallengeAction::TurnRight),
            "blink" => Ok(ChallengeAction::Blink),
            "nod" => Ok(ChallengeAction::Nod),
            "smile" => Ok(ChallengeAction::Smile),
            other => Err(format!("unknown challenge action: {other}")),
        }
    }
}

impl std::fmt::Display for ChallengeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of evaluating one frame against the active challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Confirmed,
    TimedOut,
}

/// One active liveness challenge.
///
/// Created when an identity is provisionally recognized; destroyed on
/// confirmation, timeout or cancellation. Exactly one challenge may be
/// active at a time per pipeline instance. The face region is the one
/// captured at challenge start; it is not re-detected mid-challenge.
#[derive(Debug)]
pub struct Challenge {
    action: ChallengeAction,
    identity: String,
    region: FaceRegion,
    started_at: Instant,
    timeout: Duration,
    /// Nose-tip position from the previous evaluated frame (nod only).
    prev_nose: Option<(f32, f32)>,
}

impl Challenge {
    /// Issue a challenge with an action chosen uniformly at random from
    /// `actions` (falls back to the default set when empty).
    pub fn issue<R: Rng>(
        rng: &mut R,
        actions: &[ChallengeAction],
        identity: String,
        region: FaceRegion,
        now: Instant,
        timeout: Duration,
    ) -> Self {
        let pool = if actions.is_empty() {
            &ChallengeAction::DEFAULT_SET[..]
        } else {
            actions
        };
        let action = *pool.choose(rng).unwrap_or(&ChallengeAction::DEFAULT_SET[0]);
        tracing::info!(%identity, %action, "liveness challenge issued");
        Self {
            action,
            identity,
            region,
            started_at: now,
            timeout,
            prev_nose: None,
        }
    }

    pub fn action(&self) -> ChallengeAction {
        self.action
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn region(&self) -> &FaceRegion {
        &self.region
    }

    /// Prompt naming the target identity and the requested action.
    pub fn prompt(&self) -> String {
        format!("{}, {}", self.identity, self.action.instruction())
    }

    /// Whether the challenge window has expired as of `now`.
    pub fn timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) > self.timeout
    }

    /// Evaluate one frame's landmarks against the active action.
    ///
    /// The timeout is checked before the signal: a valid signal arriving
    /// after the window still times out.
    pub fn evaluate(&mut self, landmarks: &Landmarks, now: Instant) -> ChallengeStatus {
        if self.timed_out(now) {
            return ChallengeStatus::TimedOut;
        }

        let confirmed = match self.action {
            ChallengeAction::TurnLeft => head_turned(landmarks, TurnDirection::Left),
            ChallengeAction::TurnRight => head_turned(landmarks, TurnDirection::Right),
            ChallengeAction::Blink => blink_detected(landmarks),
            ChallengeAction::Nod => nod_detected(landmarks, &mut self.prev_nose),
            ChallengeAction::Smile => smile_detected(landmarks),
        };

        if confirmed {
            ChallengeStatus::Confirmed
        } else {
            ChallengeStatus::Pending
        }
    }
}

enum TurnDirection {
    Left,
    Right,
}

/// Head turn: nose tip offset from the midpoint of the two eye centers by
/// more than [`HEAD_TURN_MIN_OFFSET`] in the commanded direction.
fn head_turned(landmarks: &Landmarks, direction: TurnDirection) -> bool {
    let left_eye = centroid(landmarks.left_eye());
    let right_eye = centroid(landmarks.right_eye());
    let eye_mid_x = (left_eye.0 + right_eye.0) / 2.0;
    let (nose_x, _) = landmarks.nose_tip();

    match direction {
        TurnDirection::Left => nose_x < eye_mid_x - HEAD_TURN_MIN_OFFSET,
        TurnDirection::Right => nose_x > eye_mid_x + HEAD_TURN_MIN_OFFSET,
    }
}

/// Blink: eye-aspect-ratio of either eye below [`BLINK_EAR_MAX`].
fn blink_detected(landmarks: &Landmarks) -> bool {
    eye_aspect_ratio(landmarks.left_eye()) < BLINK_EAR_MAX
        || eye_aspect_ratio(landmarks.right_eye()) < BLINK_EAR_MAX
}

/// Eye aspect ratio over the six eye points: the two vertical eyelid
/// distances over twice the horizontal eye width. Open eyes sit around
/// 0.3; a closed eye drops well below 0.2.
pub fn eye_aspect_ratio(eye: &[(f32, f32)]) -> f32 {
    debug_assert_eq!(eye.len(), 6);
    let a = dist(eye[1], eye[5]);
    let b = dist(eye[2], eye[4]);
    let c = dist(eye[0], eye[3]);
    if c <= f32::EPSILON {
        // Degenerate geometry; treat as open rather than a blink.
        return 1.0;
    }
    (a + b) / (2.0 * c)
}

/// Nod: nose-tip displacement between consecutive evaluated frames above
/// [`NOD_MIN_MOVEMENT`]. The first evaluated frame only records the nose
/// position and never confirms.
fn nod_detected(landmarks: &Landmarks, prev_nose: &mut Option<(f32, f32)>) -> bool {
    let nose = landmarks.nose_tip();
    let Some(prev) = prev_nose.replace(nose) else {
        return false;
    };
    dist(nose, prev) > NOD_MIN_MOVEMENT
}

/// Smile: mouth opening height above [`SMILE_HEIGHT_RATIO`] × mouth width.
fn smile_detected(landmarks: &Landmarks) -> bool {
    let mouth = landmarks.mouth();
    let width = dist(mouth[0], mouth[6]);
    let height = dist(mouth[2], mouth[10]);
    height > width * SMILE_HEIGHT_RATIO
}

fn dist(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::types::{Landmarks, LANDMARK_COUNT};

    /// Synthetic neutral face: eye centers at x=75 and x=105 (midpoint 90),
    /// nose tip at (90, 80), both eyes open with EAR 0.3, closed mouth.
    pub fn neutral() -> [(f32, f32); LANDMARK_COUNT] {
        let mut pts = [(0.0f32, 0.0f32); LANDMARK_COUNT];
        // Jaw and brows: coarse placeholders, unused by the evaluators.
        for (i, p) in pts.iter_mut().enumerate().take(27) {
            *p = (60.0 + i as f32 * 3.0, 40.0);
        }
        // Nose bridge 27–29, tip 30, nostrils 31–35.
        pts[27] = (90.0, 62.0);
        pts[28] = (90.0, 68.0);
        pts[29] = (90.0, 74.0);
        pts[30] = (90.0, 80.0);
        for (i, p) in pts.iter_mut().enumerate().take(36).skip(31) {
            *p = (84.0 + (i - 31) as f32 * 3.0, 84.0);
        }
        set_eye(&mut pts, 36, 75.0, 0.3);
        set_eye(&mut pts, 42, 105.0, 0.3);
        set_mouth(&mut pts, 3.0);
        pts
    }

    /// Write a 6-point eye centered at (`cx`, 60) with width 10 and the
    /// given aspect ratio.
    pub fn set_eye(pts: &mut [(f32, f32); LANDMARK_COUNT], base: usize, cx: f32, ear: f32) {
        // EAR = (A + B) / (2C) with C = 10; choosing A = B = 10·ear gives
        // eyelid points offset ±5·ear from the eye line.
        let offset = ear * 5.0;
        pts[base] = (cx - 5.0, 60.0);
        pts[base + 1] = (cx - 2.0, 60.0 - offset);
        pts[base + 2] = (cx + 2.0, 60.0 - offset);
        pts[base + 3] = (cx + 5.0, 60.0);
        pts[base + 4] = (cx + 2.0, 60.0 + offset);
        pts[base + 5] = (cx - 2.0, 60.0 + offset);
    }

    /// Mouth with width 10 centered at (90, 95) and the given opening height.
    pub fn set_mouth(pts: &mut [(f32, f32); LANDMARK_COUNT], height: f32) {
        for (i, p) in pts.iter_mut().enumerate().take(68).skip(48) {
            *p = (85.0 + (i - 48) as f32 * 0.5, 95.0);
        }
        pts[48] = (85.0, 95.0); // left corner
        pts[54] = (95.0, 95.0); // right corner (mouth[6])
        pts[50] = (89.0, 95.0 - height / 2.0); // upper lip (mouth[2])
        pts[58] = (89.0, 95.0 + height / 2.0); // lower lip (mouth[10])
    }

    pub fn landmarks(pts: [(f32, f32); LANDMARK_COUNT]) -> Landmarks {
        Landmarks::new(pts)
    }
}
