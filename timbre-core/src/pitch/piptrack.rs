//! Peak-interpolating pitch tracker over an STFT magnitude spectrogram.
//!
//! ## Algorithm
//!
//! For each frame:
//! 1. Bins whose magnitude does not exceed `threshold * frame_max` are zeroed.
//! 2. Remaining bins inside `[fmin, fmax)` that are local maxima along the
//!    frequency axis (`x[k] > x[k-1] && x[k] >= x[k+1]`, edges replicated)
//!    become pitch candidates.
//! 3. Each candidate is refined by parabolic interpolation over its two
//!    neighbours: the fractional bin shift gives the frequency, the parabola
//!    skew is added to the magnitude.
//!
//! Non-candidate cells stay zero in both output matrices.

use ndarray::Array2;

use crate::spectral::{fft_frequencies, Stft};

pub const DEFAULT_N_FFT: usize = 2048;
pub const DEFAULT_HOP: usize = 512;
pub const DEFAULT_FMIN: f32 = 150.0;
pub const DEFAULT_FMAX: f32 = 4_000.0;
pub const DEFAULT_THRESHOLD: f32 = 0.1;

/// Pitch and magnitude per `[bin, frame]`.
#[derive(Debug, Clone)]
pub struct PitchTrack {
    pub pitches: Array2<f32>,
    pub magnitudes: Array2<f32>,
}

impl PitchTrack {
    pub fn n_frames(&self) -> usize {
        self.pitches.ncols()
    }
}

pub struct PitchTracker {
    stft: Stft,
    sample_rate: u32,
    threshold: f32,
    /// Per-bin flag for `fmin <= f < fmax`.
    in_band: Vec<bool>,
}

impl PitchTracker {
    pub fn new(sample_rate: u32, n_fft: usize, hop: usize, fmin: f32, fmax: f32, threshold: f32) -> Self {
        let in_band = fft_frequencies(sample_rate, n_fft)
            .into_iter()
            .map(|f| f >= fmin && f < fmax)
            .collect();
        Self {
            stft: Stft::new(n_fft, hop),
            sample_rate,
            threshold,
            in_band,
        }
    }

    /// Tracker with the standard analysis settings at `sample_rate`.
    pub fn with_defaults(sample_rate: u32) -> Self {
        Self::new(
            sample_rate,
            DEFAULT_N_FFT,
            DEFAULT_HOP,
            DEFAULT_FMIN,
            DEFAULT_FMAX,
            DEFAULT_THRESHOLD,
        )
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn track(&self, samples: &[f32]) -> PitchTrack {
        let spec = self.stft.magnitude(samples);
        let (n_bins, n_frames) = spec.dim();
        let mut pitches = Array2::<f32>::zeros((n_bins, n_frames));
        let mut magnitudes = Array2::<f32>::zeros((n_bins, n_frames));
        if n_bins < 3 {
            return PitchTrack { pitches, magnitudes };
        }

        let bin_hz = self.sample_rate as f32 / self.stft.n_fft() as f32;

        for t in 0..n_frames {
            let col = spec.column(t);
            let floor = self.threshold * col.iter().copied().fold(0.0f32, f32::max);
            let gated = |k: usize| if col[k] > floor { col[k] } else { 0.0 };

            for k in 0..n_bins {
                if !self.in_band[k] {
                    continue;
                }
                let x = gated(k);
                let prev = gated(k.saturating_sub(1));
                let next = gated((k + 1).min(n_bins - 1));
                if !(x > prev && x >= next) {
                    continue;
                }

                let (avg, shift) = if k > 0 && k + 1 < n_bins {
                    let avg = 0.5 * (col[k + 1] - col[k - 1]);
                    let curve = 2.0 * col[k] - col[k + 1] - col[k - 1];
                    let denom = if curve.abs() < f32::MIN_POSITIVE {
                        curve + 1.0
                    } else {
                        curve
                    };
                    (avg, avg / denom)
                } else {
                    (0.0, 0.0)
                };

                pitches[[k, t]] = (k as f32 + shift) * bin_hz;
                magnitudes[[k, t]] = col[k] + 0.5 * avg * shift;
            }
        }

        PitchTrack { pitches, magnitudes }
    }
}
