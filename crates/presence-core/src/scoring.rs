//! Distance → confidence normalization.

use thiserror::Error;

/// Reference normalization constant for LBPH chi-square distances.
pub const DEFAULT_D_MAX: f64 = 300.0;

#[derive(Error, Debug, PartialEq)]
pub enum ScoringError {
    #[error("d_max must be a positive finite number, got {0}")]
    InvalidDMax(f64),
}

/// Maps a raw classifier distance onto an integer confidence in [0, 100].
///
/// `confidence = 100 × (1 − distance / d_max)`, clamped and truncated.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceScorer {
    d_max: f64,
}

impl ConfidenceScorer {
    pub fn new(d_max: f64) -> Result<Self, ScoringError> {
        if !d_max.is_finite() || d_max <= 0.0 {
            return Err(ScoringError::InvalidDMax(d_max));
        }
        Ok(Self { d_max })
    }

    pub fn d_max(&self) -> f64 {
        self.d_max
    }

    pub fn score(&self, distance: f64) -> u8 {
        if distance.is_nan() {
            return 0;
        }
        let raw = 100.0 - 100.0 * distance / self.d_max;
        raw.clamp(0.0, 100.0).floor() as u8
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self { d_max: DEFAULT_D_MAX }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance_is_full_confidence() {
        assert_eq!(ConfidenceScorer::default().score(0.0), 100);
    }

    #[test]
    fn test_distance_at_or_beyond_d_max_is_zero() {
        let s = ConfidenceScorer::default();
        assert_eq!(s.score(300.0), 0);
        assert_eq!(s.score(301.5), 0);
        assert_eq!(s.score(1e9), 0);
        assert_eq!(s.score(f64::INFINITY), 0);
    }

    #[test]
    fn test_reference_values() {
        let s = ConfidenceScorer::default();
        // 100 * (1 - 45/300) = 85
        assert_eq!(s.score(45.0), 85);
        // 100 * (1 - 90/300) = 70
        assert_eq!(s.score(90.0), 70);
        // 100 * (1 - 91/300) = 69.66 -> 69
        assert_eq!(s.score(91.0), 69);
    }

    #[test]
    fn test_monotonically_non_increasing() {
        let s = ConfidenceScorer::default();
        let mut prev = s.score(0.0);
        let mut d = 0.0;
        while d < 400.0 {
            d += 0.37;
            let c = s.score(d);
            assert!(c <= prev, "score rose from {prev} to {c} at distance {d}");
            prev = c;
        }
    }

    #[test]
    fn test_negative_and_nan_distances_stay_in_range() {
        let s = ConfidenceScorer::default();
        assert_eq!(s.score(-5.0), 100);
        assert_eq!(s.score(f64::NAN), 0);
    }

    #[test]
    fn test_rejects_bad_d_max() {
        assert_eq!(ConfidenceScorer::new(0.0).unwrap_err(), ScoringError::InvalidDMax(0.0));
        assert!(ConfidenceScorer::new(-1.0).is_err());
        assert!(ConfidenceScorer::new(f64::NAN).is_err());
        assert!(ConfidenceScorer::new(f64::INFINITY).is_err());
        assert_eq!(ConfidenceScorer::new(150.0).unwrap().score(75.0), 50);
    }
}
