//! Nearest-neighbour identity matching over enrolled encodings.

use crate::types::{Encoding, Identity, MatchResult};
use thiserror::Error;

/// Default maximum tolerable Euclidean distance, matching the calibration of
/// 128-dimensional dlib-style face embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("probe has {actual} dimensions, enrolled encodings have {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("match threshold must be finite and non-negative, got {0}")]
    InvalidThreshold(f64),
}

/// Strategy for resolving a probe encoding against a set of candidates.
pub trait Matcher {
    fn resolve(
        &self,
        probe: &Encoding,
        candidates: &[Identity],
    ) -> Result<MatchResult, MatchError>;
}

/// Euclidean nearest-neighbour matcher with a distance threshold.
///
/// Every candidate is scanned and the global minimum among tolerable ones
/// wins, so the result does not depend on where the best match sits in the
/// candidate order. Exact ties go to the first-seen candidate.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    threshold: f64,
}

impl EuclideanMatcher {
    pub fn new(threshold: f64) -> Result<Self, MatchError> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(MatchError::InvalidThreshold(threshold));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn resolve(
        &self,
        probe: &Encoding,
        candidates: &[Identity],
    ) -> Result<MatchResult, MatchError> {
        let mut best: Option<(usize, f64)> = None;

        for (i, candidate) in candidates.iter().enumerate() {
            let expected = candidate.encoding.dimension();
            if probe.dimension() != expected {
                return Err(MatchError::DimensionMismatch {
                    expected,
                    actual: probe.dimension(),
                });
            }

            let distance = probe.distance(&candidate.encoding);
            if distance > self.threshold {
                continue;
            }
            // Strict comparison keeps the first-seen candidate on ties.
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        Ok(match best {
            Some((idx, distance)) => MatchResult::Matched {
                identity: candidates[idx].clone(),
                distance,
            },
            None => MatchResult::NoMatch,
        })
    }
}
