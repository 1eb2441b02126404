//! `HttpInferenceClient`: multipart POSTs to a remote conversion service.
//!
//! One blocking request per call, issued from the pool worker thread. Inline
//! audio and local model files go up as file parts; remote references go as
//! `*_url` text fields so the service fetches them itself.

use std::time::Duration;

use reqwest::blocking::multipart::{Form, Part};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    artifact::ArtifactRef,
    error::{Result, TimbreError},
    inference::{AudioRef, ConversionRequest, InferenceBackend, SeparationRequest},
};

pub struct HttpInferenceClient {
    conversion_url: String,
    separation_url: Option<String>,
    timeout: Duration,
    api_key: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(conversion_url: impl Into<String>) -> Self {
        Self {
            conversion_url: conversion_url.into(),
            separation_url: None,
            timeout: Duration::from_secs(600),
            api_key: None,
        }
    }

    pub fn with_separation_url(mut self, url: impl Into<String>) -> Self {
        self.separation_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn post(&self, url: &str, form: Form) -> Result<Value> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| TimbreError::RemoteInference(format!("client build failed: {e}")))?;

        let mut request = client.post(url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .map_err(|e| TimbreError::RemoteInference(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            warn!(%status, url, "inference request returned non-success status");
            return Err(TimbreError::RemoteInference(format!(
                "{url} returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json::<Value>()
            .map_err(|e| TimbreError::RemoteInference(format!("response from {url} is not JSON: {e}")))
    }
}

impl InferenceBackend for HttpInferenceClient {
    fn convert(&self, request: &ConversionRequest) -> Result<Value> {
        let p = &request.params;
        let mut form = Form::new()
            .text("algorithm", p.algorithm.clone())
            .text("pitch", request.pitch.to_string())
            .text("index_influence", p.index_influence.to_string())
            .text("filter_radius", p.filter_radius.to_string())
            .text("rms_mix", p.rms_mix.to_string())
            .text("protect", p.protect.to_string());

        for audio in &request.audio {
            form = attach_audio(form, "audio", audio)?;
        }
        form = attach_artifact(form, "weights", &request.weights)?;
        form = attach_artifact(form, "index", &request.index)?;

        debug!(
            url = %self.conversion_url,
            inputs = request.audio.len(),
            pitch = request.pitch,
            "posting conversion request"
        );
        self.post(&self.conversion_url, form)
    }

    fn separate(&self, request: &SeparationRequest) -> Result<Value> {
        let Some(url) = &self.separation_url else {
            return Err(TimbreError::RemoteInference(
                "no separation endpoint configured".into(),
            ));
        };
        let form = Form::new()
            .text("stem", request.stem.as_str())
            .text("dereverb", request.dereverb.to_string());
        let form = attach_audio(form, "media", &request.media)?;
        debug!(url = %url, stem = request.stem.as_str(), "posting separation request");
        self.post(url, form)
    }
}

fn attach_audio(form: Form, field: &str, audio: &AudioRef) -> Result<Form> {
    match audio {
        AudioRef::Wav { name, bytes } => {
            let part = Part::bytes(bytes.as_ref().clone())
                .file_name(name.clone())
                .mime_str("audio/wav")
                .map_err(|e| TimbreError::RemoteInference(format!("bad {field} part: {e}")))?;
            Ok(form.part(field.to_string(), part))
        }
        AudioRef::Remote(uri) => Ok(form.text(format!("{field}_url"), uri.clone())),
    }
}

fn attach_artifact(form: Form, field: &str, artifact: &ArtifactRef) -> Result<Form> {
    match artifact {
        ArtifactRef::Local(path) => {
            let part = Part::file(path).map_err(|e| {
                TimbreError::RemoteInference(format!("cannot attach {}: {e}", path.display()))
            })?;
            Ok(form.part(field.to_string(), part))
        }
        ArtifactRef::Remote(uri) => Ok(form.text(format!("{field}_url"), uri.clone())),
    }
}
