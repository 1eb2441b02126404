//! Stitches per-segment outputs back into one track.
//!
//! Completion order is meaningless: results are ordered by `segment_index`
//! and the set must cover `0..expected` exactly once.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    audio::Waveform,
    convert::InferenceResult,
    error::{Result, TimbreError},
    store::BlobStore,
};

/// Sort `results` by segment index, failing on gaps or duplicates.
pub fn order_results(mut results: Vec<InferenceResult>, expected: usize) -> Result<Vec<InferenceResult>> {
    results.sort_by_key(|r| r.segment_index);

    let mut seen = vec![false; expected];
    let mut duplicated = false;
    for r in &results {
        match seen.get_mut(r.segment_index) {
            Some(slot) if !*slot => *slot = true,
            _ => duplicated = true,
        }
    }
    let missing: Vec<usize> = seen
        .iter()
        .enumerate()
        .filter_map(|(i, &s)| (!s).then_some(i))
        .collect();

    if !missing.is_empty() || duplicated || results.len() != expected {
        return Err(TimbreError::IncompleteResultSet { expected, missing });
    }
    Ok(results)
}

pub struct Reassembler {
    blobs: Arc<dyn BlobStore>,
}

impl Reassembler {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Fetch and concatenate outputs in index order. Parts at another rate
    /// are resampled to the first part's rate.
    pub fn assemble(&self, results: Vec<InferenceResult>, expected: usize) -> Result<Waveform> {
        let ordered = order_results(results, expected)?;
        let mut parts: Vec<Waveform> = Vec::with_capacity(ordered.len());
        for r in &ordered {
            let part = Waveform::from_wav_bytes(&self.blobs.get(&r.output_uri)?)?;
            let part = match parts.first() {
                Some(first) if first.sample_rate != part.sample_rate => {
                    debug!(segment = r.segment_index, from = part.sample_rate, to = first.sample_rate, "resampling part");
                    part.resampled(first.sample_rate)?
                }
                _ => part,
            };
            parts.push(part);
        }
        Waveform::concat(&parts)
    }

    /// Assemble and upload once to `path`. Returns the stored URI and the
    /// assembled waveform.
    pub fn assemble_to(
        &self,
        results: Vec<InferenceResult>,
        expected: usize,
        path: &str,
    ) -> Result<(String, Waveform)> {
        let track = self.assemble(results, expected)?;
        let uri = self.blobs.put(path, track.to_wav_bytes()?)?;
        info!(segments = expected, duration_ms = track.duration_ms(), uri = %uri, "track reassembled");
        Ok((uri, track))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlobStore;

    fn result(i: usize) -> InferenceResult {
        InferenceResult {
            segment_index: i,
            output_uri: format!("mem://seg{i}.wav"),
        }
    }

    #[test]
    fn ordering_restores_index_order() {
        let ordered = order_results(vec![result(2), result(0), result(1)], 3).unwrap();
        let idx: Vec<usize> = ordered.iter().map(|r| r.segment_index).collect();
        assert_eq!(idx, vec![0, 1, 2]);
    }

    #[test]
    fn gaps_and_duplicates_are_fatal() {
        match order_results(vec![result(0), result(2)], 3) {
            Err(TimbreError::IncompleteResultSet { expected, missing }) => {
                assert_eq!(expected, 3);
                assert_eq!(missing, vec![1]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(order_results(vec![result(0), result(0), result(1)], 2).is_err());
        assert!(order_results(vec![result(0), result(5)], 2).is_err());
    }

    #[test]
    fn mixed_rates_are_normalized_to_the_first() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let a = blobs
            .put("a.wav", Waveform::new(vec![0.1; 1_600], 16_000).to_wav_bytes().unwrap())
            .unwrap();
        let b = blobs
            .put("b.wav", Waveform::new(vec![0.1; 800], 8_000).to_wav_bytes().unwrap())
            .unwrap();
        let r = Reassembler::new(blobs);
        let track = r
            .assemble(
                vec![
                    InferenceResult { segment_index: 1, output_uri: b },
                    InferenceResult { segment_index: 0, output_uri: a },
                ],
                2,
            )
            .unwrap();
        assert_eq!(track.sample_rate, 16_000);
        assert_eq!(track.len(), 3_200);
    }
}
