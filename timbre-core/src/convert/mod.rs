//! Per-segment conversion: build the request, call the backend, validate the
//! response, and persist the output at a deterministic blob path.
//!
//! Paths are keyed by job, model, segment and pitch, so a repeated attempt
//! overwrites only its own output and never another segment's or job's.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    artifact::ModelArtifact,
    audio::Waveform,
    engine::CancelToken,
    error::{Result, TimbreError},
    inference::{
        validate_response, AudioRef, ConversionParams, ConversionRequest, InferenceHandle,
        SeparationRequest, Stem,
    },
    segment::Segment,
    store::{paths, BlobStore},
};

/// Identifies the job a call belongs to and carries its cancel token.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub job_id: String,
    pub model_id: String,
    pub cancel: CancelToken,
}

/// One converted segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResult {
    pub segment_index: usize,
    pub output_uri: String,
}

pub struct ConversionInvoker {
    inference: InferenceHandle,
    blobs: Arc<dyn BlobStore>,
}

impl ConversionInvoker {
    pub fn new(inference: InferenceHandle, blobs: Arc<dyn BlobStore>) -> Self {
        Self { inference, blobs }
    }

    /// Convert one segment and store it under its conversion path.
    pub fn convert_segment(
        &self,
        ctx: &InvocationContext,
        segment: &Segment,
        artifact: &ModelArtifact,
        pitch: f32,
        params: &ConversionParams,
    ) -> Result<InferenceResult> {
        let path = paths::conversion(
            &ctx.job_id,
            &ctx.model_id,
            segment.index,
            &paths::pitch_key(pitch),
        );
        let audio = AudioRef::wav(
            format!("seg{:04}.wav", segment.index),
            segment.waveform.to_wav_bytes()?,
        );
        let output_uri = self.convert_to(ctx, audio, artifact, pitch, params, &path)?;
        Ok(InferenceResult {
            segment_index: segment.index,
            output_uri,
        })
    }

    /// Convert `audio` and store the output at `path`. Returns the stored URI.
    pub fn convert_to(
        &self,
        ctx: &InvocationContext,
        audio: AudioRef,
        artifact: &ModelArtifact,
        pitch: f32,
        params: &ConversionParams,
        path: &str,
    ) -> Result<String> {
        let request = ConversionRequest {
            audio: vec![audio],
            weights: artifact.weights.clone(),
            index: artifact.index.clone(),
            pitch,
            params: params.clone(),
        };

        ctx.cancel.check()?;
        let response = self.inference.convert(&request)?;
        let output = validate_response(&response).inspect_err(|e| {
            warn!(job_id = %ctx.job_id, path, error = %e, "conversion rejected");
        })?;

        let bytes = self.fetch_audio(&output)?;
        ctx.cancel.check()?;
        let uri = self.blobs.put(path, bytes)?;
        debug!(job_id = %ctx.job_id, pitch, path, "conversion stored");
        Ok(uri)
    }

    /// Store a silent segment's own audio in place of a conversion.
    pub fn passthrough(&self, ctx: &InvocationContext, segment: &Segment) -> Result<InferenceResult> {
        ctx.cancel.check()?;
        let path = paths::passthrough(&ctx.job_id, &ctx.model_id, segment.index);
        let output_uri = self.blobs.put(&path, segment.waveform.to_wav_bytes()?)?;
        debug!(job_id = %ctx.job_id, segment = segment.index, "silent segment passed through");
        Ok(InferenceResult {
            segment_index: segment.index,
            output_uri,
        })
    }

    /// Extract one stem of `media` and store it under the job's separation
    /// path. Returns the stored URI and the decoded stem.
    pub fn separate(
        &self,
        ctx: &InvocationContext,
        media: AudioRef,
        stem: Stem,
        dereverb: bool,
    ) -> Result<(String, Waveform)> {
        self.separate_to(ctx, media, stem, dereverb, &paths::separated(&ctx.job_id, stem))
    }

    /// Like [`separate`](Self::separate), storing the stem at `path`.
    pub fn separate_to(
        &self,
        ctx: &InvocationContext,
        media: AudioRef,
        stem: Stem,
        dereverb: bool,
        path: &str,
    ) -> Result<(String, Waveform)> {
        ctx.cancel.check()?;
        let response = self.inference.separate(&SeparationRequest {
            media,
            stem,
            dereverb,
        })?;
        let output = validate_response(&response)?;
        let bytes = self.fetch_audio(&output)?;
        let waveform = Waveform::from_wav_bytes(&bytes)?;
        ctx.cancel.check()?;
        let uri = self.blobs.put(path, bytes)?;
        debug!(job_id = %ctx.job_id, stem = stem.as_str(), path, "stem stored");
        Ok((uri, waveform))
    }

    /// Fetch a service output and check it decodes as audio.
    fn fetch_audio(&self, uri: &str) -> Result<Vec<u8>> {
        let bytes = self.blobs.get(uri)?;
        Waveform::from_wav_bytes(&bytes).map_err(|e| {
            TimbreError::RemoteInference(format!("output {uri} is not usable audio: {e}"))
        })?;
        Ok(bytes)
    }
}
