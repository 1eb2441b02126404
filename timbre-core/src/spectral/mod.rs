//! Short-time Fourier analysis shared by the pitch tracker and the scorer.
//!
//! Frames are centred (the signal is reflect-padded by `n_fft / 2` on both
//! sides), windowed with a periodic Hann window and transformed with a
//! planned rustfft forward FFT. Matrices are `[freq_bin, frame]`.

use std::sync::Arc;

use ndarray::Array2;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Reusable STFT plan for one `(n_fft, hop)` pair.
pub struct Stft {
    n_fft: usize,
    hop: usize,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl Stft {
    pub fn new(n_fft: usize, hop: usize) -> Self {
        Self {
            n_fft,
            hop: hop.max(1),
            window: hann_window(n_fft),
            fft: FftPlanner::<f32>::new().plan_fft_forward(n_fft),
        }
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Number of non-negative frequency bins (`n_fft / 2 + 1`).
    pub fn n_freqs(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Number of centred frames produced for `len` input samples.
    pub fn n_frames(&self, len: usize) -> usize {
        if len == 0 {
            0
        } else {
            1 + len / self.hop
        }
    }

    /// `|X|` per bin and frame.
    pub fn magnitude(&self, samples: &[f32]) -> Array2<f32> {
        self.analyze(samples, |c| c.norm())
    }

    /// `|X|^2` per bin and frame.
    pub fn power(&self, samples: &[f32]) -> Array2<f32> {
        self.analyze(samples, |c| c.norm_sqr())
    }

    fn analyze(&self, samples: &[f32], f: impl Fn(&Complex<f32>) -> f32) -> Array2<f32> {
        let n_freqs = self.n_freqs();
        let n_frames = self.n_frames(samples.len());
        let mut out = Array2::<f32>::zeros((n_freqs, n_frames));
        if n_frames == 0 {
            return out;
        }

        let centered = reflect_pad(samples, self.n_fft / 2);
        let mut buf = vec![Complex::new(0.0f32, 0.0); self.n_fft];

        for frame in 0..n_frames {
            let start = frame * self.hop;
            for (i, v) in buf.iter_mut().enumerate() {
                let s = centered.get(start + i).copied().unwrap_or(0.0);
                *v = Complex::new(s * self.window[i], 0.0);
            }
            self.fft.process(&mut buf);
            for k in 0..n_freqs {
                out[[k, frame]] = f(&buf[k]);
            }
        }
        out
    }
}

/// Mel-scaled power spectrogram (Slaney mel scale, area-normalised filters).
pub struct MelSpectrogram {
    stft: Stft,
    /// `[n_mels, n_freqs]`
    filters: Array2<f32>,
}

impl MelSpectrogram {
    pub fn new(sample_rate: u32, n_fft: usize, hop: usize, n_mels: usize) -> Self {
        let fmax = sample_rate as f32 / 2.0;
        Self {
            stft: Stft::new(n_fft, hop),
            filters: build_mel_filters(n_fft, sample_rate, n_mels, 0.0, fmax),
        }
    }

    pub fn n_mels(&self) -> usize {
        self.filters.nrows()
    }

    /// `[n_mels, frames]` mel power.
    pub fn compute(&self, samples: &[f32]) -> Array2<f32> {
        let power = self.stft.power(samples);
        self.filters.dot(&power)
    }
}

/// Periodic Hann window of length `n`.
pub fn hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

/// Centre frequency in Hz of each STFT bin.
pub fn fft_frequencies(sample_rate: u32, n_fft: usize) -> Vec<f32> {
    (0..=n_fft / 2)
        .map(|k| k as f32 * sample_rate as f32 / n_fft as f32)
        .collect()
}

pub fn build_mel_filters(
    n_fft: usize,
    sample_rate: u32,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
) -> Array2<f32> {
    let n_freqs = n_fft / 2 + 1;
    let mel_min = hz_to_mel_slaney(fmin);
    let mel_max = hz_to_mel_slaney(fmax);

    let hz_pts: Vec<f32> = (0..=(n_mels + 1))
        .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32)
        .map(mel_to_hz_slaney)
        .collect();
    let fft_freqs = fft_frequencies(sample_rate, n_fft);

    let mut filters = Array2::<f32>::zeros((n_mels, n_freqs));
    for m in 0..n_mels {
        let (lower, center, upper) = (hz_pts[m], hz_pts[m + 1], hz_pts[m + 2]);
        let down_denom = (center - lower).max(1e-10);
        let up_denom = (upper - center).max(1e-10);
        let enorm = 2.0 / (upper - lower).max(1e-10);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let w = if freq >= lower && freq <= center {
                (freq - lower) / down_denom
            } else if freq > center && freq <= upper {
                (upper - freq) / up_denom
            } else {
                0.0
            };
            filters[[m, k]] = (w * enorm).max(0.0);
        }
    }
    filters
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    if pad == 0 {
        return samples.to_vec();
    }
    if samples.len() <= 1 {
        let v = samples.first().copied().unwrap_or(0.0);
        return vec![v; samples.len() + pad * 2];
    }

    let n = samples.len() as isize;
    (-(pad as isize)..(n + pad as isize))
        .map(|i| samples[reflect_index(i, samples.len())])
        .collect()
}

fn reflect_index(mut i: isize, len: usize) -> usize {
    let max = len as isize - 1;
    while i < 0 || i > max {
        if i < 0 {
            i = -i;
        } else {
            i = 2 * max - i;
        }
    }
    i as usize
}

const F_SP: f32 = 200.0 / 3.0;
const MIN_LOG_HZ: f32 = 1_000.0;
const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP; // 15

fn log_step() -> f32 {
    6.4f32.ln() / 27.0
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        mel * F_SP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tone(freq: f32, rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn slaney_mel_round_trips() {
        for hz in [0.0f32, 300.0, 999.0, 1_000.0, 4_000.0, 11_025.0] {
            assert_relative_eq!(mel_to_hz_slaney(hz_to_mel_slaney(hz)), hz, max_relative = 1e-4);
        }
        assert_relative_eq!(hz_to_mel_slaney(1_000.0), 15.0);
    }

    #[test]
    fn frame_count_is_centered() {
        let stft = Stft::new(2048, 512);
        assert_eq!(stft.n_frames(0), 0);
        assert_eq!(stft.n_frames(22_050), 1 + 22_050 / 512);
        assert_eq!(stft.magnitude(&vec![0.0; 1_000]).dim(), (1025, 2));
    }

    #[test]
    fn sine_peaks_in_expected_bin() {
        let rate = 22_050;
        let stft = Stft::new(2048, 512);
        let mag = stft.magnitude(&tone(1_000.0, rate, rate as usize));
        let col = mag.column(10);
        let (peak_bin, _) = col
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) });
        let expected = (1_000.0 * 2048.0 / rate as f32).round() as usize;
        assert!((peak_bin as isize - expected as isize).abs() <= 1);
    }

    #[test]
    fn mel_filters_are_non_negative_and_shaped() {
        let f = build_mel_filters(2048, 22_050, 128, 0.0, 11_025.0);
        assert_eq!(f.dim(), (128, 1025));
        assert!(f.iter().all(|&v| v >= 0.0));
        // every band picks up some energy
        for row in f.rows() {
            assert!(row.sum() > 0.0);
        }
    }

    #[test]
    fn mel_spectrogram_of_silence_is_zero() {
        let mel = MelSpectrogram::new(22_050, 2048, 512, 128);
        let s = mel.compute(&vec![0.0; 4_096]);
        assert_eq!(s.nrows(), 128);
        assert!(s.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn reflect_pad_mirrors_edges() {
        let padded = reflect_pad(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]);
    }
}
