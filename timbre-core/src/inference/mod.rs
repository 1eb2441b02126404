//! Remote inference abstraction.
//!
//! The `InferenceBackend` trait decouples the pipeline from the service that
//! actually runs voice conversion and source separation (in-process echo
//! stub, HTTP endpoint, scripted test doubles).
//!
//! Backends take `&self`: a call is one stateless request/response exchange,
//! so many pool workers may call the same backend at once. Responses are the
//! service's raw JSON; [`validate_response`] turns them into an audio
//! reference or a `RemoteInference` error.

pub mod stub;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpInferenceClient;
pub use stub::StubBackend;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    artifact::ArtifactRef,
    error::{Result, TimbreError},
};

/// Contract for conversion/separation services.
pub trait InferenceBackend: Send + Sync + 'static {
    /// Convert `request.audio` into the timbre of the given model.
    ///
    /// Blocks until the service responds. The returned value is unvalidated.
    fn convert(&self, request: &ConversionRequest) -> Result<Value>;

    /// Extract one stem from a mixed recording.
    fn separate(&self, request: &SeparationRequest) -> Result<Value>;
}

/// Thread-safe reference-counted handle to any backend.
#[derive(Clone)]
pub struct InferenceHandle(pub Arc<dyn InferenceBackend>);

impl InferenceHandle {
    pub fn new<B: InferenceBackend>(backend: B) -> Self {
        Self(Arc::new(backend))
    }

    pub fn convert(&self, request: &ConversionRequest) -> Result<Value> {
        self.0.convert(request)
    }

    pub fn separate(&self, request: &SeparationRequest) -> Result<Value> {
        self.0.separate(request)
    }
}

impl std::fmt::Debug for InferenceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceHandle").finish_non_exhaustive()
    }
}

/// Audio handed to the service: inline WAV bytes or a URI it can fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioRef {
    Wav { name: String, bytes: Arc<Vec<u8>> },
    Remote(String),
}

impl AudioRef {
    pub fn wav(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        AudioRef::Wav {
            name: name.into(),
            bytes: Arc::new(bytes),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            AudioRef::Wav { name, bytes } => format!("{name} ({} bytes)", bytes.len()),
            AudioRef::Remote(uri) => uri.clone(),
        }
    }
}

/// Knobs forwarded verbatim to the conversion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionParams {
    /// Pitch extraction algorithm name.
    pub algorithm: String,
    /// Retrieval index influence, 0..=1.
    pub index_influence: f32,
    /// Median filter radius applied to the extracted pitch.
    pub filter_radius: u32,
    /// Output volume envelope mix, 0..=1.
    pub rms_mix: f32,
    /// Consonant and breath protection, 0..=0.5.
    pub protect: f32,
}

impl ConversionParams {
    /// Preset used for pitch sweeps and single-reference conversions.
    pub fn sweep() -> Self {
        Self {
            algorithm: "rmvpe".into(),
            index_influence: 1.0,
            filter_radius: 4,
            rms_mix: 1.0,
            protect: 0.35,
        }
    }

    /// Preset used for remix and chunked-remix jobs.
    pub fn remix() -> Self {
        Self {
            algorithm: "rmvpe+".into(),
            index_influence: 0.75,
            filter_radius: 3,
            rms_mix: 0.25,
            protect: 0.5,
        }
    }
}

impl Default for ConversionParams {
    fn default() -> Self {
        Self::sweep()
    }
}

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub audio: Vec<AudioRef>,
    pub weights: ArtifactRef,
    pub index: ArtifactRef,
    /// Pitch control value, in whatever convention the caller chose.
    pub pitch: f32,
    pub params: ConversionParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stem {
    Vocal,
    Background,
}

impl Stem {
    pub fn as_str(self) -> &'static str {
        match self {
            Stem::Vocal => "vocal",
            Stem::Background => "background",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeparationRequest {
    pub media: AudioRef,
    pub stem: Stem,
    pub dereverb: bool,
}

/// Extract the output audio reference from a service response.
///
/// Accepts an array whose first element is a string, or an object whose
/// `data` field is such an array. Anything else, including an `error` field
/// at the top level or inside the array, is a remote failure.
pub fn validate_response(response: &Value) -> Result<String> {
    let items = match response {
        Value::Array(items) => items,
        Value::Object(map) => {
            if let Some(err) = map.get("error").filter(|e| !e.is_null()) {
                return Err(TimbreError::RemoteInference(error_text(err)));
            }
            match map.get("data") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(TimbreError::RemoteInference(
                        "response object has no data array".into(),
                    ))
                }
            }
        }
        other => {
            return Err(TimbreError::RemoteInference(format!(
                "unexpected response: {}",
                truncate(&other.to_string())
            )))
        }
    };

    if let Some(err) = items
        .iter()
        .find_map(|item| item.get("error").filter(|e| !e.is_null()))
    {
        return Err(TimbreError::RemoteInference(error_text(err)));
    }

    match items.first() {
        Some(Value::String(uri)) if !uri.trim().is_empty() => Ok(uri.clone()),
        Some(other) => Err(TimbreError::RemoteInference(format!(
            "first result is not an audio reference: {}",
            truncate(&other.to_string())
        ))),
        None => Err(TimbreError::RemoteInference("empty result list".into())),
    }
}

fn error_text(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        other => truncate(&other.to_string()),
    }
}

fn truncate(s: &str) -> String {
    const MAX: usize = 200;
    match s.char_indices().nth(MAX) {
        Some((i, _)) => format!("{}…", &s[..i]),
        None => s.to_string(),
    }
}
