//! Windowed RMS silence detection.
//!
//! ## Algorithm
//!
//! 1. Slide a window of `min_silence` samples across the waveform, stepping by
//!    `seek_step` samples (the final window is always aligned to the end).
//! 2. A window whose RMS is at or below the linear threshold marks a silent
//!    window start.
//! 3. Silent window starts that are contiguous or whose windows overlap merge
//!    into one range `[first_start, last_start + min_silence)`.
//! 4. Non-silent spans are the complement of the silent ranges.
//!
//! Window RMS comes from a prefix sum of squares, so each window costs O(1).

use std::ops::Range;

/// Silence detector configured in samples.
#[derive(Debug, Clone, Copy)]
pub struct SilenceDetector {
    /// Linear RMS level at or below which a window is silent.
    threshold: f32,
    /// Window length and minimum silent run, in samples.
    min_silence: usize,
    /// Window stride in samples (at least 1).
    seek_step: usize,
}

impl SilenceDetector {
    pub fn new(threshold_dbfs: f32, min_silence: usize, seek_step: usize) -> Self {
        Self {
            threshold: db_to_linear(threshold_dbfs),
            min_silence: min_silence.max(1),
            seek_step: seek_step.max(1),
        }
    }

    pub fn threshold_linear(&self) -> f32 {
        self.threshold
    }

    /// Silent ranges, ascending and non-overlapping.
    pub fn detect_silence(&self, samples: &[f32]) -> Vec<Range<usize>> {
        let len = samples.len();
        if len < self.min_silence {
            return Vec::new();
        }

        let prefix = prefix_sum_of_squares(samples);
        let window_rms = |start: usize| -> f32 {
            let sum = prefix[start + self.min_silence] - prefix[start];
            (sum.max(0.0) / self.min_silence as f64).sqrt() as f32
        };

        let last_start = len - self.min_silence;
        let mut starts: Vec<usize> = (0..=last_start).step_by(self.seek_step).collect();
        if last_start % self.seek_step != 0 {
            starts.push(last_start);
        }

        let mut ranges = Vec::new();
        let mut current: Option<(usize, usize)> = None; // (range_start, prev_start)
        for start in starts.into_iter().filter(|&s| window_rms(s) <= self.threshold) {
            current = match current {
                None => Some((start, start)),
                Some((range_start, prev)) => {
                    let continuous = start == prev + self.seek_step;
                    let has_gap = start > prev + self.min_silence;
                    if !continuous && has_gap {
                        ranges.push(range_start..prev + self.min_silence);
                        Some((start, start))
                    } else {
                        Some((range_start, start))
                    }
                }
            };
        }
        if let Some((range_start, prev)) = current {
            ranges.push(range_start..prev + self.min_silence);
        }
        ranges
    }

    /// Non-silent spans: the complement of [`detect_silence`](Self::detect_silence).
    ///
    /// No silence yields the whole buffer; an entirely silent buffer yields
    /// nothing.
    pub fn detect_nonsilent(&self, samples: &[f32]) -> Vec<Range<usize>> {
        let len = samples.len();
        let silent = self.detect_silence(samples);
        if silent.is_empty() {
            return if len == 0 { Vec::new() } else { vec![0..len] };
        }

        let mut spans = Vec::with_capacity(silent.len() + 1);
        let mut prev_end = 0usize;
        for r in &silent {
            if r.start > prev_end {
                spans.push(prev_end..r.start);
            }
            prev_end = r.end;
        }
        if prev_end < len {
            spans.push(prev_end..len);
        }
        spans
    }
}

pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

fn prefix_sum_of_squares(samples: &[f32]) -> Vec<f64> {
    let mut prefix = Vec::with_capacity(samples.len() + 1);
    let mut acc = 0.0f64;
    prefix.push(acc);
    for &s in samples {
        acc += (s as f64) * (s as f64);
        prefix.push(acc);
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    /// loud / quiet / loud at 1 kHz-ish sample units
    fn gapped(loud: usize, quiet: usize) -> Vec<f32> {
        let mut v = vec![0.5f32; loud];
        v.extend(std::iter::repeat(0.0).take(quiet));
        v.extend(std::iter::repeat(0.5).take(loud));
        v
    }

    #[test]
    fn db_conversion() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(-20.0) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn finds_single_gap() {
        let det = SilenceDetector::new(-22.0, 100, 10);
        let samples = gapped(500, 300);
        let silent = det.detect_silence(&samples);
        assert_eq!(silent, vec![500..800]);
        assert_eq!(det.detect_nonsilent(&samples), vec![0..500, 800..1300]);
    }

    #[test]
    fn gap_shorter_than_minimum_is_ignored() {
        let det = SilenceDetector::new(-22.0, 400, 10);
        let samples = gapped(500, 300);
        assert!(det.detect_silence(&samples).is_empty());
        assert_eq!(det.detect_nonsilent(&samples), vec![0..1300]);
    }

    #[test]
    fn fully_silent_has_no_nonsilent_spans() {
        let det = SilenceDetector::new(-22.0, 100, 10);
        let samples = vec![0.0f32; 1_000];
        assert_eq!(det.detect_silence(&samples), vec![0..1_000]);
        assert!(det.detect_nonsilent(&samples).is_empty());
    }

    #[test]
    fn buffer_shorter_than_window() {
        let det = SilenceDetector::new(-22.0, 100, 10);
        assert!(det.detect_silence(&[0.0; 50]).is_empty());
        assert_eq!(det.detect_nonsilent(&[0.0; 50]), vec![0..50]);
        assert!(det.detect_nonsilent(&[]).is_empty());
    }

    #[test]
    fn leading_and_trailing_silence() {
        let det = SilenceDetector::new(-22.0, 100, 10);
        let mut samples = vec![0.0f32; 200];
        samples.extend(std::iter::repeat(0.5).take(300));
        samples.extend(std::iter::repeat(0.0).take(200));
        assert_eq!(det.detect_nonsilent(&samples), vec![200..500]);
    }
}
