//! Spectral similarity and SNR scoring of candidates against a reference.
//!
//! ## Steps
//!
//! 1. Everything is resampled to the scoring rate (22.05 kHz by default).
//! 2. Each candidate is length-aligned to the reference: zero-padded when
//!    shorter, truncated when longer.
//! 3. Similarity is the cosine between the flattened mel power spectrograms,
//!    scaled to 0..=100.
//! 4. SNR is `10 * log10(P_ref / P_residual)` over the aligned samples,
//!    clamped to ±`MAX_SNR_DB` so identical or silent inputs stay finite.
//! 5. The best candidate is the first with maximal similarity; the composite
//!    averages the maximal similarity and the maximal SNR.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    audio::Waveform,
    error::{Result, TimbreError},
    spectral::MelSpectrogram,
};

/// SNR reported for a residual with no energy.
pub const MAX_SNR_DB: f64 = 100.0;

pub const DEFAULT_N_FFT: usize = 2048;
pub const DEFAULT_HOP: usize = 512;
pub const DEFAULT_N_MELS: usize = 128;

const SIMILARITY_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityScore {
    /// 0..=100
    pub similarity: f64,
    /// dB
    pub snr: f64,
    pub composite: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateScore {
    pub index: usize,
    pub uri: Option<String>,
    pub similarity: f64,
    pub snr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreReport {
    pub candidates: Vec<CandidateScore>,
    pub best_index: usize,
    pub best_uri: Option<String>,
    pub score: QualityScore,
}

/// A candidate waveform with the URI it was loaded from, if any.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub uri: Option<String>,
    pub waveform: Waveform,
}

impl Candidate {
    pub fn new(uri: impl Into<Option<String>>, waveform: Waveform) -> Self {
        Self {
            uri: uri.into(),
            waveform,
        }
    }
}

pub struct QualityScorer {
    sample_rate: u32,
    mel: MelSpectrogram,
}

impl QualityScorer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            mel: MelSpectrogram::new(sample_rate, DEFAULT_N_FFT, DEFAULT_HOP, DEFAULT_N_MELS),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Similarity and SNR of one candidate against `reference`.
    ///
    /// `reference` must already be at the scoring rate; see [`Self::prepare`].
    pub fn compare(&self, reference: &Waveform, candidate: &Waveform) -> Result<(f64, f64)> {
        let candidate = candidate.resampled(self.sample_rate)?;
        let aligned = align_to(&candidate.samples, reference.len());

        let ref_mel = self.mel.compute(&reference.samples);
        let cand_mel = self.mel.compute(&aligned);
        let ref_flat: Vec<f32> = ref_mel.iter().copied().collect();
        let cand_flat: Vec<f32> = cand_mel.iter().copied().collect();
        let similarity = cosine_similarity(&ref_flat, &cand_flat);
        let snr = snr_db(&reference.samples, &aligned);
        Ok((similarity, snr))
    }

    /// Resample a reference to the scoring rate once, for repeated `compare`s.
    pub fn prepare(&self, reference: &Waveform) -> Result<Waveform> {
        reference.resampled(self.sample_rate)
    }

    pub fn score(&self, reference: &Waveform, candidates: &[Candidate]) -> Result<ScoreReport> {
        if candidates.is_empty() {
            return Err(TimbreError::InvalidJob("no candidates to score".into()));
        }
        let reference = self.prepare(reference)?;

        let mut scored = Vec::with_capacity(candidates.len());
        for (index, c) in candidates.iter().enumerate() {
            let (similarity, snr) = self.compare(&reference, &c.waveform)?;
            debug!(index, similarity, snr, "candidate scored");
            scored.push(CandidateScore {
                index,
                uri: c.uri.clone(),
                similarity,
                snr,
            });
        }
        Ok(summarize(scored))
    }
}

/// Pick the best candidate and compute the composite.
fn summarize(candidates: Vec<CandidateScore>) -> ScoreReport {
    let mut best_index = 0;
    for (i, c) in candidates.iter().enumerate() {
        if c.similarity > candidates[best_index].similarity {
            best_index = i;
        }
    }
    let max_similarity = candidates[best_index].similarity;
    let max_snr = candidates
        .iter()
        .map(|c| c.snr)
        .fold(f64::NEG_INFINITY, f64::max);
    let composite = SIMILARITY_WEIGHT * max_similarity + (1.0 - SIMILARITY_WEIGHT) * max_snr;

    ScoreReport {
        best_uri: candidates[best_index].uri.clone(),
        best_index,
        score: QualityScore {
            similarity: max_similarity,
            snr: max_snr,
            composite,
        },
        candidates,
    }
}

/// `samples` zero-padded or truncated to `len`.
pub fn align_to(samples: &[f32], len: usize) -> Vec<f32> {
    let mut out = samples[..samples.len().min(len)].to_vec();
    out.resize(len, 0.0);
    out
}

/// Cosine between `a` and `b` scaled to 0..=100. Two silent inputs are
/// identical (100); exactly one silent input shares nothing (0).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    match (na > 0.0, nb > 0.0) {
        (false, false) => 100.0,
        (true, true) => (100.0 * dot / (na.sqrt() * nb.sqrt())).clamp(0.0, 100.0),
        _ => 0.0,
    }
}

/// `10 * log10(P_signal / P_noise)` with the residual as noise, clamped to
/// ±`MAX_SNR_DB`.
pub fn snr_db(reference: &[f32], candidate: &[f32]) -> f64 {
    let n = reference.len().min(candidate.len());
    if n == 0 {
        return MAX_SNR_DB;
    }
    let (mut signal, mut noise) = (0.0f64, 0.0f64);
    for (&r, &c) in reference[..n].iter().zip(&candidate[..n]) {
        let (r, c) = (r as f64, c as f64);
        signal += r * r;
        noise += (r - c) * (r - c);
    }
    if noise == 0.0 {
        return MAX_SNR_DB;
    }
    if signal == 0.0 {
        return -MAX_SNR_DB;
    }
    (10.0 * (signal / noise).log10()).clamp(-MAX_SNR_DB, MAX_SNR_DB)
}
