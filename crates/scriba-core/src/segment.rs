//! Timestamped transcript segments.
//!
//! Times are audio-relative seconds. Inside the decoder a segment is
//! chunk-local; from the merger onward it is absolute. A committed
//! segment list is sorted by start and non-overlapping.

use serde::{Deserialize, Serialize};

/// Maximum residual overlap tolerated between adjacent committed
/// segments, in seconds.
pub const OVERLAP_TOLERANCE_SECS: f64 = 0.05;

/// A single timestamped transcript unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start instant in seconds.
    pub start: f64,
    /// End instant in seconds, `end >= start`.
    pub end: f64,
    /// Transcript text, whitespace-trimmed and non-empty.
    pub text: String,
}

impl Segment {
    /// Build a segment with trimmed text.
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into().trim().to_string(),
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Finite, ordered times and non-empty text. Segments failing this
    /// are dropped (with a warning count) rather than failing the job.
    pub fn is_valid(&self) -> bool {
        self.start.is_finite()
            && self.end.is_finite()
            && self.end >= self.start
            && !self.text.trim().is_empty()
    }
}

/// Whether a slice satisfies the committed-list ordering invariant:
/// sorted by start, and `end_i <= start_{i+1}` within tolerance.
pub fn is_ordered(segments: &[Segment]) -> bool {
    segments.windows(2).all(|w| {
        w[0].start <= w[1].start && w[0].end <= w[1].start + OVERLAP_TOLERANCE_SECS
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_trims_text() {
        let s = Segment::new(0.0, 1.0, "  hello \n");
        assert_eq!(s.text, "hello");
    }

    #[test]
    fn validity_rejects_nan_and_empty() {
        assert!(Segment::new(0.0, 1.0, "ok").is_valid());
        assert!(!Segment::new(f64::NAN, 1.0, "x").is_valid());
        assert!(!Segment::new(0.0, f64::INFINITY, "x").is_valid());
        assert!(!Segment::new(2.0, 1.0, "x").is_valid());
        assert!(!Segment::new(0.0, 1.0, "   ").is_valid());
    }

    #[test]
    fn ordering_allows_small_tolerance() {
        let a = Segment::new(0.0, 1.02, "a");
        let b = Segment::new(1.0, 2.0, "b");
        assert!(is_ordered(&[a.clone(), b.clone()]));
        let c = Segment::new(0.0, 1.2, "c");
        assert!(!is_ordered(&[c, b]));
    }
}
