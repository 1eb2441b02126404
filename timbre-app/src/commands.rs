//! HTTP intake handlers.
//!
//! Every submit route validates its body, enqueues one job and answers
//! `202 Accepted` with the job acknowledgement. Results are observed by
//! polling `GET /jobs/{id}` or the model record.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use timbre_core::{JobAck, JobKind, JobRecord, JobRequest, ReferenceSource, TimbreError};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::{AppDiagnostics, AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/get-inferred-audio", post(get_inferred_audio))
        .route("/remix", post(remix))
        .route("/juice-vrse", post(juice_vrse))
        .route("/get-score", post(get_score))
        .route("/split-for-remix", post(split_for_remix))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<TimbreError> for ApiError {
    fn from(e: TimbreError) -> Self {
        let status = match e {
            TimbreError::InvalidJob(_) => StatusCode::BAD_REQUEST,
            TimbreError::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

type Accepted = (StatusCode, Json<JobAck>);

/// Run a store-touching engine call off the async workers.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AppState) -> timbre_core::Result<T> + Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("intake task failed: {e}"),
        })?
        .map_err(ApiError::from)
}

async fn enqueue(state: &AppState, request: JobRequest) -> Result<Accepted, ApiError> {
    let kind = request.kind.name();
    match blocking(state, move |s| s.engine.enqueue(request)).await {
        Ok(ack) => {
            state.intake.accept();
            info!(job_id = %ack.job_id, kind, "intake accepted job");
            Ok((StatusCode::ACCEPTED, Json(ack)))
        }
        Err(e) => {
            state.intake.reject();
            warn!(kind, status = %e.status, error = %e.message, "intake rejected job");
            Err(e)
        }
    }
}

fn required(field: Option<String>, missing: &str, state: &AppState) -> Result<String, ApiError> {
    match field.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) => Ok(v),
        None => {
            state.intake.reject();
            Err(ApiError::bad_request(missing))
        }
    }
}

// ── Health ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    running: bool,
    inference: &'static str,
    diagnostics: AppDiagnostics,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        running: state.engine.is_running(),
        inference: if state.settings.inference_url.is_some() {
            "http"
        } else {
            "stub"
        },
        diagnostics: state.diagnostics_snapshot(),
    })
}

// ── Jobs ─────────────────────────────────────────────────────────────────────

/// POST /jobs: any job kind in the engine's own wire format.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<Accepted, ApiError> {
    enqueue(&state, request).await
}

/// GET /jobs/{id}: the persisted record with the live status laid over it.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let lookup = id.clone();
    let found = blocking(&state, move |s| {
        let status = s.engine.job_status(&lookup)?;
        let record = s.engine.repository().find_job(&lookup)?;
        Ok(record.map(|mut r| {
            if let Some(status) = status {
                r.status = status;
            }
            r
        }))
    })
    .await?;
    found.map(Json).ok_or_else(|| ApiError {
        status: StatusCode::NOT_FOUND,
        message: format!("job {id} not found"),
    })
}

/// POST /jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.cancel(&id)?;
    Ok(StatusCode::ACCEPTED)
}

// ── Original endpoints ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferredAudioBody {
    pub model_id: Option<String>,
    pub spotify_artist_id: Option<String>,
    /// Direct reference, used when no artist id is given.
    pub reference_url: Option<String>,
    pub pitch_min: Option<i32>,
    pub pitch_max: Option<i32>,
}

/// POST /get-inferred-audio: pitch sweep of a model over an artist's stem.
pub async fn get_inferred_audio(
    State(state): State<AppState>,
    Json(body): Json<InferredAudioBody>,
) -> Result<Accepted, ApiError> {
    const MISSING: &str = "Missing modelId or spotifyArtistId in request body";
    let model_id = required(body.model_id, MISSING, &state)?;
    let reference = match (body.spotify_artist_id, body.reference_url) {
        (Some(artist), _) if !artist.trim().is_empty() => ReferenceSource::ArtistId(artist),
        (_, url) => ReferenceSource::Uri(required(url, MISSING, &state)?),
    };
    let range = &state.engine.config().sweep_pitch_range;
    let kind = JobKind::FullPitchSweep {
        pitch_min: body.pitch_min.unwrap_or(*range.start()),
        pitch_max: body.pitch_max.unwrap_or(*range.end()),
    };
    enqueue(&state, JobRequest::new(kind, model_id, reference)).await
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemixBody {
    pub model_id: Option<String>,
    pub reference_url: Option<String>,
}

/// POST /remix: one whole-reference conversion with the remix preset.
pub async fn remix(
    State(state): State<AppState>,
    Json(body): Json<RemixBody>,
) -> Result<Accepted, ApiError> {
    const MISSING: &str = "Missing modelId or referenceUrl";
    let model_id = required(body.model_id, MISSING, &state)?;
    let reference = required(body.reference_url, MISSING, &state)?;
    enqueue(
        &state,
        JobRequest::new(JobKind::Remix, model_id, ReferenceSource::Uri(reference)),
    )
    .await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JuiceBody {
    pub model_id: Option<String>,
    #[serde(alias = "sunoLink")]
    pub source_url: Option<String>,
    #[serde(default = "default_true")]
    pub separate_stems: bool,
}

fn default_true() -> bool {
    true
}

/// POST /juice-vrse: chunked conversion of a full song, vocal stem separated
/// and mixed back over the background by default.
pub async fn juice_vrse(
    State(state): State<AppState>,
    Json(body): Json<JuiceBody>,
) -> Result<Accepted, ApiError> {
    const MISSING: &str = "Missing modelId or sunoLink";
    let model_id = required(body.model_id, MISSING, &state)?;
    let source = required(body.source_url, MISSING, &state)?;
    let kind = JobKind::ChunkedRemix {
        separate_stems: body.separate_stems,
    };
    enqueue(
        &state,
        JobRequest::new(kind, model_id, ReferenceSource::Uri(source)),
    )
    .await
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBody {
    pub model_id: Option<String>,
    pub reference_audio_url: Option<String>,
    /// Defaults to the model's recorded sweep candidates.
    pub inferred_audio_urls: Option<Vec<String>>,
}

/// POST /get-score: score candidates against the reference and write the
/// best one to the model record.
pub async fn get_score(
    State(state): State<AppState>,
    Json(body): Json<ScoreBody>,
) -> Result<Accepted, ApiError> {
    const MISSING: &str = "Missing modelId or referenceAudioUrl in request body";
    let model_id = required(body.model_id, MISSING, &state)?;
    let reference = required(body.reference_audio_url, MISSING, &state)?;
    let candidate_uris = match body.inferred_audio_urls {
        Some(urls) => urls,
        None => {
            let id = model_id.clone();
            blocking(&state, move |s| s.engine.repository().get_model(&id))
                .await?
                .inferred_audio_urls
        }
    };
    enqueue(
        &state,
        JobRequest::new(
            JobKind::Score { candidate_uris },
            model_id,
            ReferenceSource::Uri(reference),
        ),
    )
    .await
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitBody {
    pub track_url: Option<String>,
    pub track_id: Option<String>,
}

/// POST /split-for-remix: separate a track into vocal and background stems
/// stored under `remix-separated/{trackId}/`.
pub async fn split_for_remix(
    State(state): State<AppState>,
    Json(body): Json<SplitBody>,
) -> Result<Accepted, ApiError> {
    const MISSING: &str = "Missing trackUrl or trackId";
    let track_url = required(body.track_url, MISSING, &state)?;
    let track_id = required(body.track_id, MISSING, &state)?;
    enqueue(
        &state,
        JobRequest::new(JobKind::Separate, track_id, ReferenceSource::Uri(track_url)),
    )
    .await
}
