//! Amplitude threshold crossing detector.
//!
//! Counts upward crossings: a sample whose magnitude reaches `threshold` while
//! the previous sample's was below it. The "previous sample" state is carried
//! across periods, so a crossing straddling a period boundary is counted once.

use super::CrossingDetector;
use crate::Sample;

#[derive(Debug, Clone)]
pub struct ThresholdCrossings {
    threshold: Sample,
    /// Whether the last sample seen was at or above threshold.
    above: bool,
}

impl ThresholdCrossings {
    pub fn new(threshold: Sample) -> Self {
        Self {
            threshold: threshold.abs(),
            above: false,
        }
    }

    pub fn threshold(&self) -> Sample {
        self.threshold
    }
}

impl Default for ThresholdCrossings {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl CrossingDetector for ThresholdCrossings {
    fn count(&mut self, samples: &[Sample]) -> u32 {
        let mut crossings = 0;
        for sample in samples {
            let above = sample.abs() >= self.threshold;
            if above && !self.above {
                crossings += 1;
            }
            self.above = above;
        }
        crossings
    }

    fn reset(&mut self) {
        self.above = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(amplitude: Sample, half_period: usize, len: usize) -> Vec<Sample> {
        (0..len)
            .map(|i| if (i / half_period) % 2 == 0 { amplitude } else { 0.0 })
            .collect()
    }

    #[test]
    fn silence_has_no_crossings() {
        let mut det = ThresholdCrossings::new(0.2);
        assert_eq!(det.count(&[0.0; 256]), 0);
    }

    #[test]
    fn counts_each_rising_edge() {
        let mut det = ThresholdCrossings::new(0.2);
        // 4 pulses of 0.5 separated by silence.
        assert_eq!(det.count(&square(0.5, 8, 64)), 4);
    }

    #[test]
    fn negative_excursions_count() {
        let mut det = ThresholdCrossings::new(0.2);
        assert_eq!(det.count(&[0.0, -0.5, 0.0, 0.5, 0.0]), 2);
    }

    #[test]
    fn state_carries_across_periods() {
        let mut det = ThresholdCrossings::new(0.2);
        assert_eq!(det.count(&[0.0, 0.0, 0.9]), 1);
        // Still above at the start of the next period: no new crossing.
        assert_eq!(det.count(&[0.9, 0.0, 0.9]), 1);
        det.reset();
        assert_eq!(det.count(&[0.9]), 1);
    }

    #[test]
    fn below_threshold_signal_is_ignored() {
        let mut det = ThresholdCrossings::new(0.6);
        assert_eq!(det.count(&square(0.5, 4, 64)), 0);
    }
}
