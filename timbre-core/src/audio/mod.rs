//! In-memory audio: the `Waveform` buffer every stage passes around, WAV
//! codec, whole-buffer resampling and overlay mixing.

pub mod resample;
pub mod wav;

use std::ops::Range;

use crate::error::{Result, TimbreError};

pub use resample::RateConverter;

/// A contiguous block of mono PCM samples at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 22050, 44100, 48000).
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// `len` samples of digital silence.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in whole milliseconds (rounded down).
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Number of samples covering `ms` milliseconds at this rate.
    pub fn ms_to_samples(&self, ms: u64) -> usize {
        (ms * self.sample_rate as u64 / 1000) as usize
    }

    /// Copy of the samples in `range`, clamped to the buffer.
    pub fn slice(&self, range: Range<usize>) -> Waveform {
        let end = range.end.min(self.samples.len());
        let start = range.start.min(end);
        Waveform::new(self.samples[start..end].to_vec(), self.sample_rate)
    }

    /// Root-mean-square level of the whole buffer (0 for an empty buffer).
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    /// Joins `parts` end to end. All parts must share one sample rate.
    pub fn concat(parts: &[Waveform]) -> Result<Waveform> {
        let Some(first) = parts.first() else {
            return Err(TimbreError::InvalidAudio(
                "cannot concatenate an empty list of waveforms".into(),
            ));
        };
        let rate = first.sample_rate;
        let total: usize = parts.iter().map(Waveform::len).sum();
        let mut samples = Vec::with_capacity(total);
        for (i, part) in parts.iter().enumerate() {
            if part.sample_rate != rate {
                return Err(TimbreError::InvalidAudio(format!(
                    "part {i} is {} Hz, expected {rate} Hz",
                    part.sample_rate
                )));
            }
            samples.extend_from_slice(&part.samples);
        }
        Ok(Waveform::new(samples, rate))
    }

    /// This waveform converted to `target_rate` (a clone when rates match).
    pub fn resampled(&self, target_rate: u32) -> Result<Waveform> {
        if self.sample_rate == target_rate {
            return Ok(self.clone());
        }
        let mut rc = RateConverter::new(self.sample_rate, target_rate)?;
        Ok(Waveform::new(rc.process(&self.samples)?, target_rate))
    }

    /// Decode a WAV byte stream (see [`wav::decode`]).
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Waveform> {
        wav::decode(bytes)
    }

    /// Encode as 16-bit mono PCM WAV (see [`wav::encode`]).
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        wav::encode(self)
    }
}

/// Mixes `top` onto `base`, sample by sample, clipped to [-1, 1].
///
/// The result has the length and rate of `base`; `top` is resampled when its
/// rate differs and is truncated or treated as silence past its end.
pub fn overlay(base: &Waveform, top: &Waveform) -> Result<Waveform> {
    let top = top.resampled(base.sample_rate)?;
    let samples = base
        .samples
        .iter()
        .enumerate()
        .map(|(i, &b)| (b + top.samples.get(i).copied().unwrap_or(0.0)).clamp(-1.0, 1.0))
        .collect();
    Ok(Waveform::new(samples, base.sample_rate))
}

pub(crate) fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_and_slice() {
        let w = Waveform::new(vec![0.1; 22_050], 22_050);
        assert_eq!(w.duration_ms(), 1000);
        assert_eq!(w.ms_to_samples(250), 5_512);
        let s = w.slice(100..200);
        assert_eq!(s.len(), 100);
        // out-of-range end is clamped
        assert_eq!(w.slice(22_000..30_000).len(), 50);
        assert!(w.slice(40_000..50_000).is_empty());
    }

    #[test]
    fn concat_preserves_order_and_rate() {
        let a = Waveform::new(vec![1.0, 2.0], 8_000);
        let b = Waveform::new(vec![3.0], 8_000);
        let joined = Waveform::concat(&[a, b]).unwrap();
        assert_eq!(joined.samples, vec![1.0, 2.0, 3.0]);
        assert_eq!(joined.sample_rate, 8_000);
    }

    #[test]
    fn concat_rejects_mixed_rates_and_empty_input() {
        let a = Waveform::new(vec![0.0], 8_000);
        let b = Waveform::new(vec![0.0], 16_000);
        assert!(matches!(
            Waveform::concat(&[a, b]),
            Err(TimbreError::InvalidAudio(_))
        ));
        assert!(matches!(
            Waveform::concat(&[]),
            Err(TimbreError::InvalidAudio(_))
        ));
    }

    #[test]
    fn overlay_clips_and_keeps_base_length() {
        let base = Waveform::new(vec![0.8, 0.8, -0.5, 0.0], 16_000);
        let top = Waveform::new(vec![0.5, -0.3], 16_000);
        let mixed = overlay(&base, &top).unwrap();
        assert_eq!(mixed.len(), 4);
        assert_eq!(mixed.samples[0], 1.0);
        assert!((mixed.samples[1] - 0.5).abs() < 1e-6);
        assert_eq!(mixed.samples[2], -0.5);
    }

    #[test]
    fn rms_of_constant_signal() {
        let w = Waveform::new(vec![0.5; 100], 16_000);
        assert!((w.rms() - 0.5).abs() < 1e-6);
        assert_eq!(Waveform::silence(0, 16_000).rms(), 0.0);
    }
}
