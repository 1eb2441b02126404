//! Silence-bounded segmentation of a waveform.
//!
//! `Segmenter::segments` returns a lazy, restartable iterator: boundaries are
//! computed once up front, sample data is copied out only as each `Segment`
//! is pulled. Chunked jobs convert segment by segment; pitch-sweep jobs skip
//! this module and use [`Segment::whole`].

pub mod silence;

use std::{ops::Range, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audio::Waveform;

pub use silence::SilenceDetector;

/// How much silence to keep around each non-silent span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepSilence {
    /// Cut exactly at the detected boundaries.
    None,
    /// Keep all surrounding silence; gaps are split at their midpoint so the
    /// segments tile the source exactly.
    All,
    /// Pad each span by this many milliseconds on both sides.
    Millis(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmenterConfig {
    /// Shortest silent run that splits two segments (ms). Default: 1000.
    pub min_silence_ms: u32,
    /// Silence level relative to full scale (dBFS). Default: -22.
    pub silence_thresh_dbfs: f32,
    /// Default: `KeepSilence::All`.
    pub keep_silence: KeepSilence,
    /// Detection window stride (ms). Default: 10.
    pub seek_step_ms: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_silence_ms: 1_000,
            silence_thresh_dbfs: -22.0,
            keep_silence: KeepSilence::All,
            seek_step_ms: 10,
        }
    }
}

/// One contiguous slice of the source waveform.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// 0-based position in the source, order-preserving.
    pub index: usize,
    /// Offset of the first sample in the source waveform.
    pub start_sample: usize,
    pub waveform: Waveform,
    pub duration_ms: u64,
    /// `true` when the slice extends past its non-silent span.
    pub is_silence_padded: bool,
}

impl Segment {
    /// The whole waveform as segment 0.
    pub fn whole(waveform: Waveform) -> Self {
        Self {
            index: 0,
            start_sample: 0,
            duration_ms: waveform.duration_ms(),
            waveform,
            is_silence_padded: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Boundary {
    range: Range<usize>,
    padded: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    config: SegmenterConfig,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Lazy sequence of segments over `waveform`.
    ///
    /// No silence or a fully silent source yields one segment covering the
    /// whole waveform. An empty source yields no segments.
    pub fn segments<'a>(&self, waveform: &'a Waveform) -> Segments<'a> {
        let boundaries = self.boundaries(waveform);
        debug!(
            segments = boundaries.len(),
            duration_ms = waveform.duration_ms(),
            "segmented waveform"
        );
        Segments {
            source: waveform,
            boundaries: boundaries.into(),
            pos: 0,
        }
    }

    /// Eager convenience over [`segments`](Self::segments).
    pub fn split(&self, waveform: &Waveform) -> Vec<Segment> {
        self.segments(waveform).collect()
    }

    fn boundaries(&self, waveform: &Waveform) -> Vec<Boundary> {
        let len = waveform.len();
        if len == 0 {
            return Vec::new();
        }

        let detector = SilenceDetector::new(
            self.config.silence_thresh_dbfs,
            waveform.ms_to_samples(self.config.min_silence_ms as u64),
            waveform.ms_to_samples(self.config.seek_step_ms as u64),
        );
        let spans = detector.detect_nonsilent(&waveform.samples);
        if spans.is_empty() {
            return vec![Boundary {
                range: 0..len,
                padded: false,
            }];
        }

        let pad = match self.config.keep_silence {
            KeepSilence::None => 0,
            KeepSilence::All => len,
            KeepSilence::Millis(ms) => waveform.ms_to_samples(ms as u64),
        };

        // Signed so padding can run past either end before clamping.
        let mut padded: Vec<(i64, i64)> = spans
            .iter()
            .map(|r| (r.start as i64 - pad as i64, r.end as i64 + pad as i64))
            .collect();
        for i in 1..padded.len() {
            let last_end = padded[i - 1].1;
            let next_start = padded[i].0;
            if next_start < last_end {
                let mid = (last_end + next_start).div_euclid(2);
                padded[i - 1].1 = mid;
                padded[i].0 = mid;
            }
        }

        spans
            .iter()
            .zip(padded)
            .map(|(span, (start, end))| {
                let start = start.max(0) as usize;
                let end = (end.max(0) as usize).min(len);
                Boundary {
                    padded: start < span.start || end > span.end,
                    range: start..end,
                }
            })
            .collect()
    }
}

/// Restartable iterator of [`Segment`]s borrowed from one source waveform.
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    source: &'a Waveform,
    boundaries: Arc<[Boundary]>,
    pos: usize,
}

impl Segments<'_> {
    /// Rewind to the first segment.
    pub fn restart(&mut self) {
        self.pos = 0;
    }

    /// Sample ranges of every segment, in order.
    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.boundaries.iter().map(|b| b.range.clone())
    }
}

impl Iterator for Segments<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        let boundary = self.boundaries.get(self.pos)?;
        let index = self.pos;
        self.pos += 1;

        let waveform = self.source.slice(boundary.range.clone());
        Some(Segment {
            index,
            start_sample: boundary.range.start,
            duration_ms: waveform.duration_ms(),
            waveform,
            is_silence_padded: boundary.padded,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.boundaries.len() - self.pos;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Segments<'_> {}
