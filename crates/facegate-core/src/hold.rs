//! Hold timer: requires continuous qualifying face presence before
//! recognition is attempted, suppressing transient false detections such
//! as a photo waved through the frame or a motion-blurred pass-by.

use std::time::{Duration, Instant};

/// Hold progress reported for the current frame.
#[derive(Debug, Clone, PartialEq)]
pub enum HoldStatus {
    /// No qualifying face this frame; the timer is cleared.
    Idle,
    /// Face held continuously, minimum duration not yet reached.
    Holding { remaining: Duration },
    /// Held for at least the minimum duration.
    Satisfied,
}

/// Debouncer over wall-clock timestamps.
///
/// The start timestamp is captured on the first passing frame and compared
/// against `now` on every poll; there is no background timer. A single
/// failing frame resets the timer immediately, with no grace period.
#[derive(Debug)]
pub struct HoldTimer {
    min_hold: Duration,
    started: Option<Instant>,
}

impl HoldTimer {
    pub fn new(min_hold: Duration) -> Self {
        Self {
            min_hold,
            started: None,
        }
    }

    /// Advance the timer for one frame. `passing` means detection and the
    /// quality gate both succeeded this frame.
    pub fn update(&mut self, passing: bool, now: Instant) -> HoldStatus {
        if !passing {
            self.started = None;
            return HoldStatus::Idle;
        }

        let started = *self.started.get_or_insert(now);
        let elapsed = now.saturating_duration_since(started);
        if elapsed >= self.min_hold {
            HoldStatus::Satisfied
        } else {
            HoldStatus::Holding {
                remaining: self.min_hold - elapsed,
            }
        }
    }

    /// Clear the timer (the orchestrator does this when consuming a
    /// satisfied hold by advancing to the challenge phase).
    pub fn reset(&mut self) {
        self.started = None;
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(2);

    #[test]
    fn test_first_passing_frame_starts_holding() {
        let mut timer = HoldTimer::new(MIN);
        let t0 = Instant::now();
        match timer.update(true, t0) {
            HoldStatus::Holding { remaining } => assert_eq!(remaining, MIN),
            other => panic!("expected Holding, got {other:?}"),
        }
    }

    #[test]
    fn test_satisfied_after_min_duration() {
        let mut timer = HoldTimer::new(MIN);
        let t0 = Instant::now();
        timer.update(true, t0);
        assert!(matches!(
            timer.update(true, t0 + Duration::from_millis(1999)),
            HoldStatus::Holding { .. }
        ));
        assert_eq!(timer.update(true, t0 + MIN), HoldStatus::Satisfied);
        // Stays satisfied while frames keep passing
        assert_eq!(
            timer.update(true, t0 + Duration::from_secs(3)),
            HoldStatus::Satisfied
        );
    }

    #[test]
    fn test_single_failing_frame_resets() {
        let mut timer = HoldTimer::new(MIN);
        let t0 = Instant::now();
        timer.update(true, t0);
        timer.update(true, t0 + Duration::from_millis(1500));
        assert_eq!(
            timer.update(false, t0 + Duration::from_millis(1600)),
            HoldStatus::Idle
        );
        // Elapsed time is measured from the new start, not the old one
        match timer.update(true, t0 + Duration::from_millis(1700)) {
            HoldStatus::Holding { remaining } => assert_eq!(remaining, MIN),
            other => panic!("expected Holding, got {other:?}"),
        }
    }

    #[test]
    fn test_remaining_counts_down() {
        let mut timer = HoldTimer::new(MIN);
        let t0 = Instant::now();
        timer.update(true, t0);
        let HoldStatus::Holding { remaining } = timer.update(true, t0 + Duration::from_millis(500))
        else {
            panic!("expected Holding");
        };
        assert_eq!(remaining, Duration::from_millis(1500));
    }

    #[test]
    fn test_reset_clears_start() {
        let mut timer = HoldTimer::new(MIN);
        let t0 = Instant::now();
        timer.update(true, t0);
        assert!(timer.started_at().is_some());
        timer.reset();
        assert!(timer.started_at().is_none());
        // Next passing frame starts over
        match timer.update(true, t0 + Duration::from_secs(10)) {
            HoldStatus::Holding { remaining } => assert_eq!(remaining, MIN),
            other => panic!("expected Holding, got {other:?}"),
        }
    }
}
