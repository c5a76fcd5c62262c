//! Nearest-neighbor identity matching with an ambiguity margin.

use crate::types::{Embedding, Gallery};

/// Thresholds for identity matching.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Maximum Euclidean distance for a positive match.
    pub distance_threshold: f32,
    /// Minimum required gap between the best and second-best distance when
    /// the gallery holds more than one identity.
    pub ambiguity_margin: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 0.45,
            ambiguity_margin: 0.1,
        }
    }
}

/// A positive identity match.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub name: String,
    pub distance: f32,
}

/// Strategy for matching a probe embedding against the enrolled gallery.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &Gallery) -> Option<Match>;
}

/// Euclidean nearest neighbor with threshold and ambiguity rejection.
///
/// An ambiguous result (two identities too close at this distance to
/// decide) is not an error: it is an explicit no-match, logged at debug.
pub struct NearestMatcher {
    cfg: MatchConfig,
}

impl NearestMatcher {
    pub fn new(cfg: MatchConfig) -> Self {
        Self { cfg }
    }
}

impl Matcher for NearestMatcher {
    fn best_match(&self, probe: &Embedding, gallery: &Gallery) -> Option<Match> {
        if gallery.is_empty() {
            return None;
        }

        let mut best_idx = 0usize;
        let mut best = f32::INFINITY;
        let mut second = f32::INFINITY;

        for (i, entry) in gallery.entries().iter().enumerate() {
            let d = probe.euclidean_distance(&entry.embedding);
            if d < best {
                second = best;
                best = d;
                best_idx = i;
            } else if d < second {
                second = d;
            }
        }

        if best >= self.cfg.distance_threshold {
            tracing::debug!(distance = best, "best gallery distance above threshold");
            return None;
        }

        // With more than one enrolled identity, require a clear winner.
        if gallery.len() > 1 && second - best <= self.cfg.ambiguity_margin {
            tracing::debug!(
                best,
                second,
                margin = self.cfg.ambiguity_margin,
                "ambiguous match rejected"
            );
            return None;
        }

        Some(Match {
            name: gallery.entries()[best_idx].name.clone(),
            distance: best,
        })
    }
}
