//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Remote conversion outputs, separated stems and reference recordings all
//! arrive at whatever rate their producer chose. Analysis (pitch, scoring)
//! runs at one fixed rate and reassembly needs every part at the rate of the
//! first. `RateConverter` converts a whole buffer in one call: full chunks go
//! through `process_into_buffer`, the tail through the partial path, and the
//! filter delay is trimmed so the output lines up with the input.
//!
//! When source rate == target rate, `RateConverter` is a passthrough and no
//! rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

use crate::error::{Result, TimbreError};

/// Input frames per rubato call.
const CHUNK_SIZE: usize = 1024;

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    ratio: f64,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a converter from `source_rate` to `target_rate` (Hz).
    ///
    /// # Errors
    /// `TimbreError::InvalidAudio` for a zero rate or when rubato rejects the ratio.
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 {
            return Err(TimbreError::InvalidAudio(format!(
                "cannot resample {source_rate} Hz -> {target_rate} Hz"
            )));
        }
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                ratio: 1.0,
                output_buf: Vec::new(),
            });
        }

        let ratio = target_rate as f64 / source_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            CHUNK_SIZE,
            1, // mono
        )
        .map_err(|e| TimbreError::InvalidAudio(format!("resampler init: {e}")))?;

        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];
        debug!(source_rate, target_rate, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            ratio,
            output_buf,
        })
    }

    /// Resample a complete buffer. The output holds `round(len * ratio)` samples.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(ref mut resampler) = self.resampler else {
            return Ok(samples.to_vec());
        };
        resampler.reset();

        let expected = (samples.len() as f64 * self.ratio).round() as usize;
        let delay = resampler.output_delay();
        let mut out = Vec::with_capacity(expected + delay + CHUNK_SIZE);
        let mut pos = 0usize;

        // ── 1. Full chunks ───────────────────────────────────────────────────
        loop {
            let need = resampler.input_frames_next();
            if samples.len() - pos < need {
                break;
            }
            let (consumed, produced) = resampler
                .process_into_buffer(&[&samples[pos..pos + need]], &mut self.output_buf, None)
                .map_err(resample_err)?;
            pos += consumed;
            out.extend_from_slice(&self.output_buf[0][..produced]);
        }

        // ── 2. Tail ──────────────────────────────────────────────────────────
        if pos < samples.len() {
            let (_, produced) = resampler
                .process_partial_into_buffer(
                    Some(&[&samples[pos..]][..]),
                    &mut self.output_buf,
                    None,
                )
                .map_err(resample_err)?;
            out.extend_from_slice(&self.output_buf[0][..produced]);
        }

        // ── 3. Flush filter delay ────────────────────────────────────────────
        while out.len() < expected + delay {
            let (_, produced) = resampler
                .process_partial_into_buffer(None::<&[&[f32]]>, &mut self.output_buf, None)
                .map_err(resample_err)?;
            if produced == 0 {
                break;
            }
            out.extend_from_slice(&self.output_buf[0][..produced]);
        }

        out.drain(..delay.min(out.len()));
        out.resize(expected, 0.0);
        Ok(out)
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

fn resample_err(e: rubato::ResampleError) -> TimbreError {
    TimbreError::InvalidAudio(format!("resampler process: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples).unwrap(), samples);
    }

    #[test]
    fn downsample_length_matches_ratio() {
        let mut rc = RateConverter::new(44_100, 22_050).unwrap();
        assert!(!rc.is_passthrough());
        let out = rc.process(&vec![0.0f32; 44_100]).unwrap();
        assert_eq!(out.len(), 22_050);
    }

    #[test]
    fn upsample_short_buffer_uses_partial_path() {
        let mut rc = RateConverter::new(16_000, 48_000).unwrap();
        // shorter than one chunk
        let out = rc.process(&vec![0.1f32; 500]).unwrap();
        assert_eq!(out.len(), 1_500);
    }

    #[test]
    fn converter_is_reusable() {
        let mut rc = RateConverter::new(48_000, 22_050).unwrap();
        let a = rc.process(&vec![0.0f32; 4_800]).unwrap();
        let b = rc.process(&vec![0.0f32; 4_800]).unwrap();
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn sine_survives_resampling() {
        let tone: Vec<f32> = (0..48_000)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin() * 0.5)
            .collect();
        let mut rc = RateConverter::new(48_000, 22_050).unwrap();
        let out = rc.process(&tone).unwrap();
        let rms = crate::audio::rms(&out[1_000..20_000]);
        // 0.5 / sqrt(2)
        assert!((rms - 0.3536).abs() < 0.02, "rms={rms}");
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(RateConverter::new(0, 16_000).is_err());
    }
}
