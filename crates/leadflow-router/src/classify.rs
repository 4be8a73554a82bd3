//! Segment classification from system-health counts.
//! Pure and deterministic: same counts, same segment.

use leadflow_core::config::ClassifierConfig;
use leadflow_core::types::{Segment, SystemCounts};

#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentClassifier {
    thresholds: ClassifierConfig,
}

impl SegmentClassifier {
    pub fn new(thresholds: ClassifierConfig) -> Self {
        Self { thresholds }
    }

    pub fn classify(&self, counts: &SystemCounts) -> Segment {
        let t = &self.thresholds;
        if counts.red >= 1 {
            return Segment::Critical;
        }
        if counts.orange >= t.orange_alone {
            return Segment::Urgent;
        }
        if counts.orange >= t.orange_paired && counts.yellow >= t.paired_yellow {
            return Segment::Urgent;
        }
        Segment::Optimize
    }
}

/// Classify with the default thresholds.
pub fn classify(counts: &SystemCounts) -> Segment {
    SegmentClassifier::default().classify(counts)
}
