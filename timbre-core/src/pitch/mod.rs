//! Fundamental pitch estimation and normalization.
//!
//! `PitchEstimator::estimate` runs the peak tracker over the whole buffer,
//! gates out every candidate whose magnitude is not above the median of the
//! full magnitude matrix, and takes the median of the surviving pitches.
//! A buffer with no surviving candidates (silence, empty input) is
//! [`PitchEstimate::Silent`]; callers pick what to do with it through
//! [`SilentSegmentPolicy`].

pub mod piptrack;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{audio::Waveform, error::Result};

pub use piptrack::{PitchTrack, PitchTracker};

/// MIDI number of the fixed reference note (C4).
pub const REFERENCE_MIDI: f32 = 60.0;

/// How a pitch estimate is turned into the control value sent to the
/// conversion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PitchConvention {
    /// Raw median frequency in Hz.
    Hz,
    /// `(midi(median_hz) - 60) / 12`.
    SemitoneOffset,
}

/// What to do with a segment whose pitch cannot be estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SilentSegmentPolicy {
    /// Keep the segment's own audio, skip conversion.
    #[default]
    Passthrough,
    /// Convert with a control value of 0.
    ZeroOffset,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PitchEstimate {
    Voiced { median_hz: f32 },
    Silent,
}

impl PitchEstimate {
    pub fn is_silent(&self) -> bool {
        matches!(self, PitchEstimate::Silent)
    }

    pub fn hz(&self) -> Option<f32> {
        match *self {
            PitchEstimate::Voiced { median_hz } => Some(median_hz),
            PitchEstimate::Silent => None,
        }
    }

    pub fn midi(&self) -> Option<f32> {
        self.hz().map(hz_to_midi)
    }

    /// Offset from C4 in octaves of semitones: `(midi - 60) / 12`.
    pub fn semitone_offset(&self) -> Option<f32> {
        self.midi().map(|m| (m - REFERENCE_MIDI) / 12.0)
    }

    pub fn control_value(&self, convention: PitchConvention) -> Option<f32> {
        match convention {
            PitchConvention::Hz => self.hz(),
            PitchConvention::SemitoneOffset => self.semitone_offset(),
        }
    }
}

pub fn hz_to_midi(hz: f32) -> f32 {
    12.0 * (hz / 440.0).log2() + 69.0
}

pub struct PitchEstimator {
    tracker: PitchTracker,
}

impl PitchEstimator {
    /// Estimator analysing at `analysis_rate` Hz; other inputs are resampled.
    pub fn new(analysis_rate: u32) -> Self {
        Self {
            tracker: PitchTracker::with_defaults(analysis_rate),
        }
    }

    pub fn with_tracker(tracker: PitchTracker) -> Self {
        Self { tracker }
    }

    pub fn analysis_rate(&self) -> u32 {
        self.tracker.sample_rate()
    }

    pub fn estimate(&self, waveform: &Waveform) -> Result<PitchEstimate> {
        if waveform.is_empty() {
            return Ok(PitchEstimate::Silent);
        }
        let analysed = waveform.resampled(self.analysis_rate())?;
        let track = self.tracker.track(&analysed.samples);
        Ok(estimate_from_track(&track))
    }
}

/// Noise-gated median over a tracked spectrogram.
pub fn estimate_from_track(track: &PitchTrack) -> PitchEstimate {
    let mut mags: Vec<f32> = track.magnitudes.iter().copied().collect();
    let Some(gate) = median(&mut mags) else {
        return PitchEstimate::Silent;
    };

    let mut voiced: Vec<f32> = track
        .pitches
        .iter()
        .zip(track.magnitudes.iter())
        .filter(|&(_, &m)| m > gate)
        .map(|(&p, _)| p)
        .collect();

    trace!(gate, candidates = voiced.len(), "pitch gate applied");
    match median(&mut voiced) {
        Some(median_hz) if median_hz > 0.0 => PitchEstimate::Voiced { median_hz },
        _ => PitchEstimate::Silent,
    }
}

/// Median with the two middle values averaged for even counts.
fn median(values: &mut [f32]) -> Option<f32> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    let mid = n / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, f32::total_cmp);
    let upper = *upper;
    if n % 2 == 1 {
        return Some(upper);
    }
    let below = lower.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    Some(0.5 * (below + upper))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tone(freq: f32, rate: u32, secs: f32) -> Waveform {
        let n = (rate as f32 * secs) as usize;
        Waveform::new(
            (0..n)
                .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
                .collect(),
            rate,
        )
    }

    #[test]
    fn median_odd_and_even() {
        assert_eq!(median(&mut []), None);
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn semitone_offset_is_relative_to_c4() {
        let c4 = PitchEstimate::Voiced { median_hz: 261.6256 };
        assert_abs_diff_eq!(c4.semitone_offset().unwrap(), 0.0, epsilon = 1e-4);
        let c5 = PitchEstimate::Voiced { median_hz: 523.2511 };
        assert_abs_diff_eq!(c5.semitone_offset().unwrap(), 1.0, epsilon = 1e-4);
        let a4 = PitchEstimate::Voiced { median_hz: 440.0 };
        assert_abs_diff_eq!(a4.control_value(PitchConvention::Hz).unwrap(), 440.0);
        assert_abs_diff_eq!(a4.midi().unwrap(), 69.0, epsilon = 1e-4);
    }

    #[test]
    fn estimates_a_pure_tone() {
        let est = PitchEstimator::new(22_050).estimate(&tone(330.0, 22_050, 1.0)).unwrap();
        let hz = est.hz().expect("voiced");
        assert!((hz - 330.0).abs() < 10.0, "hz={hz}");
    }

    #[test]
    fn resamples_before_analysis() {
        let est = PitchEstimator::new(22_050).estimate(&tone(330.0, 44_100, 1.0)).unwrap();
        let hz = est.hz().expect("voiced");
        assert!((hz - 330.0).abs() < 10.0, "hz={hz}");
    }

    #[test]
    fn repeated_estimates_are_identical() {
        let est = PitchEstimator::new(22_050);
        let w = tone(220.0, 22_050, 0.75);
        let a = est.estimate(&w).unwrap();
        let b = est.estimate(&w).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.semitone_offset(), b.semitone_offset());
    }

    #[test]
    fn silence_and_empty_are_silent_not_errors() {
        let est = PitchEstimator::new(22_050);
        let silent = est.estimate(&Waveform::silence(22_050, 22_050)).unwrap();
        assert!(silent.is_silent());
        assert_eq!(silent.semitone_offset(), None);
        let empty = est.estimate(&Waveform::new(Vec::new(), 22_050)).unwrap();
        assert!(empty.is_silent());
    }
}
