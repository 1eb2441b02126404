//! Typed access to the `models`, `reference_artists` and `jobs` collections.

use std::sync::Arc;

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{
    document::{by, DocumentStore},
    retry::{wait_until_found, RetryPolicy},
};
use crate::{
    engine::{
        job::{JobOutcome, JobRecord},
        CancelToken,
    },
    error::{Result, TimbreError},
    events::JobStatus,
    score::ScoreReport,
};

pub const MODELS: &str = "models";
pub const REFERENCE_ARTISTS: &str = "reference_artists";
pub const JOBS: &str = "jobs";

/// Attempts at a revision-checked score write before giving up.
const MAX_SCORE_WRITE_ATTEMPTS: u32 = 5;

/// A voice model's metadata record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelRecord {
    pub id: String,
    pub name: Option<String>,
    /// Ordered artifact sources: one archive, or weights + index files.
    pub file_urls: Vec<String>,
    /// Which archive to use when `file_urls` lists several.
    pub archive_index: Option<usize>,
    pub inferred_audio_urls: Vec<String>,
    pub similarity: Option<f64>,
    pub snr: Option<f64>,
    pub composite_score: Option<f64>,
    pub best_candidate_uri: Option<String>,
    pub revision: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReferenceArtistRecord {
    pub spotify_artist_id: String,
    pub name: Option<String>,
    /// Isolated vocal stem used as the conversion reference.
    pub audio_stem_url: Option<String>,
    pub revision: u64,
}

#[derive(Clone)]
pub struct ModelRepository {
    docs: Arc<dyn DocumentStore>,
    lookup: RetryPolicy,
}

impl ModelRepository {
    pub fn new(docs: Arc<dyn DocumentStore>, lookup: RetryPolicy) -> Self {
        Self { docs, lookup }
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.docs
    }

    // ── Models ───────────────────────────────────────────────────────────────

    pub fn find_model(&self, model_id: &str) -> Result<Option<ModelRecord>> {
        self.find_typed(MODELS, &by("id", model_id))
    }

    pub fn get_model(&self, model_id: &str) -> Result<ModelRecord> {
        self.find_model(model_id)?.ok_or_else(|| TimbreError::NotFound {
            collection: MODELS.into(),
            key: model_id.into(),
        })
    }

    /// Wait (bounded) for a model record to appear.
    pub fn wait_for_model(&self, model_id: &str, cancel: &CancelToken) -> Result<ModelRecord> {
        wait_until_found(&format!("model {model_id}"), &self.lookup, cancel, || {
            self.find_model(model_id)
        })
    }

    pub fn insert_model(&self, record: &ModelRecord) -> Result<()> {
        self.docs.insert_one(MODELS, to_value(record)?)
    }

    /// Attach sweep outputs to the model.
    pub fn record_candidates(&self, model_id: &str, uris: &[String]) -> Result<u64> {
        self.docs.update_one(
            MODELS,
            &by("id", model_id),
            &json!({ "inferredAudioUrls": uris }),
            None,
        )
    }

    /// Overwrite the model's score fields.
    ///
    /// The write names the revision it read. On a conflict the record is
    /// re-read and the write reapplied, up to `MAX_SCORE_WRITE_ATTEMPTS` times.
    pub fn record_score(&self, model_id: &str, report: &ScoreReport) -> Result<u64> {
        let patch = json!({
            "similarity": report.score.similarity,
            "snr": report.score.snr,
            "compositeScore": report.score.composite,
            "bestCandidateUri": report.best_uri,
        });

        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.get_model(model_id)?;
            match self
                .docs
                .update_one(MODELS, &by("id", model_id), &patch, Some(current.revision))
            {
                Ok(rev) => {
                    debug!(model_id, revision = rev, attempt, "score recorded");
                    return Ok(rev);
                }
                Err(TimbreError::RevisionConflict { expected, found, .. })
                    if attempt < MAX_SCORE_WRITE_ATTEMPTS =>
                {
                    warn!(model_id, expected, found, attempt, "score write raced, reapplying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Reference artists ────────────────────────────────────────────────────

    pub fn find_reference_artist(&self, artist_id: &str) -> Result<Option<ReferenceArtistRecord>> {
        self.find_typed(REFERENCE_ARTISTS, &by("spotifyArtistId", artist_id))
    }

    /// Wait (bounded) until the artist record exists and names a stem.
    pub fn wait_for_reference_stem(&self, artist_id: &str, cancel: &CancelToken) -> Result<String> {
        wait_until_found(
            &format!("reference stem for artist {artist_id}"),
            &self.lookup,
            cancel,
            || {
                Ok(self
                    .find_reference_artist(artist_id)?
                    .and_then(|a| a.audio_stem_url)
                    .filter(|u| !u.is_empty()))
            },
        )
    }

    pub fn insert_reference_artist(&self, record: &ReferenceArtistRecord) -> Result<()> {
        self.docs.insert_one(REFERENCE_ARTISTS, to_value(record)?)
    }

    // ── Jobs ─────────────────────────────────────────────────────────────────

    pub fn insert_job(&self, record: &JobRecord) -> Result<()> {
        self.docs.insert_one(JOBS, to_value(record)?)
    }

    pub fn find_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.find_typed(JOBS, &by("id", job_id))
    }

    /// Jobs are written only by the worker that owns them.
    pub fn update_job(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&str>,
        outcome: Option<&JobOutcome>,
    ) -> Result<u64> {
        let mut patch = json!({
            "status": status,
            "updatedAt": Utc::now(),
        });
        if let Some(error) = error {
            patch["error"] = Value::from(error);
        }
        if let Some(outcome) = outcome {
            patch["outcome"] = to_value(outcome)?;
        }
        self.docs.update_one(JOBS, &by("id", job_id), &patch, None)
    }

    fn find_typed<T: DeserializeOwned>(&self, collection: &str, filter: &Value) -> Result<Option<T>> {
        match self.docs.find_one(collection, filter)? {
            Some(doc) => serde_json::from_value(doc).map(Some).map_err(|e| {
                TimbreError::Other(anyhow::anyhow!("malformed {collection} record: {e}"))
            }),
            None => Ok(None),
        }
    }
}

fn to_value<T: Serialize>(v: &T) -> Result<Value> {
    serde_json::to_value(v).map_err(|e| TimbreError::Other(e.into()))
}
