//! `StubBackend`: in-process stand-in for the remote inference service.
//!
//! Used for local runs without a GPU service and throughout the tests.
//! Conversion echoes the first input with a deterministic tone mixed in
//! whose level grows with `|pitch|`, so pitch 0 is an exact echo and sweeps
//! produce distinguishable, rankable candidates. Outputs are uploaded to the
//! stub's own blob store and returned in the service's list shape.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde_json::{json, Value};
use tracing::debug;

use crate::{
    audio::Waveform,
    error::{Result, TimbreError},
    inference::{AudioRef, ConversionRequest, InferenceBackend, SeparationRequest, Stem},
    store::BlobStore,
};

/// Frequency of the tone mixed into converted audio.
const MARKER_HZ: f32 = 1_000.0;
/// Marker amplitude per unit of pitch control value.
const MARKER_GAIN: f32 = 0.01;

pub struct StubBackend {
    blobs: Arc<dyn BlobStore>,
    calls: AtomicU64,
}

impl StubBackend {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            calls: AtomicU64::new(0),
        }
    }

    /// Total convert + separate calls served.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn load(&self, audio: &AudioRef) -> Result<Waveform> {
        match audio {
            AudioRef::Wav { bytes, .. } => Waveform::from_wav_bytes(bytes),
            AudioRef::Remote(uri) => Waveform::from_wav_bytes(&self.blobs.get(uri)?),
        }
    }

    fn publish(&self, kind: &str, waveform: &Waveform) -> Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed);
        let path = format!("stub/{kind}/{n:06}-{:08x}.wav", rand::random::<u32>());
        let uri = self.blobs.put(&path, waveform.to_wav_bytes()?)?;
        Ok(json!([uri]))
    }
}

impl InferenceBackend for StubBackend {
    fn convert(&self, request: &ConversionRequest) -> Result<Value> {
        let Some(first) = request.audio.first() else {
            return Ok(json!({ "error": "no input audio" }));
        };
        let input = self.load(first)?;
        if !request.pitch.is_finite() {
            return Err(TimbreError::RemoteInference(format!(
                "pitch {} is not a number",
                request.pitch
            )));
        }

        let level = MARKER_GAIN * request.pitch.abs();
        let rate = input.sample_rate.max(1) as f32;
        let samples = input
            .samples
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let marker = (2.0 * std::f32::consts::PI * MARKER_HZ * i as f32 / rate).sin();
                (s + level * marker).clamp(-1.0, 1.0)
            })
            .collect();
        debug!(
            input = %first.describe(),
            pitch = request.pitch,
            weights = %request.weights,
            "stub conversion"
        );
        self.publish("convert", &Waveform::new(samples, input.sample_rate))
    }

    fn separate(&self, request: &SeparationRequest) -> Result<Value> {
        let input = self.load(&request.media)?;
        let stem = match request.stem {
            Stem::Vocal => input,
            Stem::Background => Waveform::silence(input.len(), input.sample_rate),
        };
        debug!(stem = request.stem.as_str(), dereverb = request.dereverb, "stub separation");
        self.publish(request.stem.as_str(), &stem)
    }
}
