use thiserror::Error;

/// All errors produced by timbre-core.
///
/// Every variant except the lifecycle ones (`AlreadyRunning`, `NotRunning`)
/// is terminal for the job that raised it: the worker boundary logs it,
/// marks the job failed and moves on. Nothing is retried automatically.
#[derive(Debug, Error)]
pub enum TimbreError {
    #[error("model artifact incomplete for {model_id}: {reason}")]
    ArtifactIncomplete { model_id: String, reason: String },

    #[error("remote inference failure: {0}")]
    RemoteInference(String),

    #[error("upstream fetch failed for {uri}: {reason}")]
    UpstreamFetch { uri: String, reason: String },

    #[error("incomplete result set: expected {expected} segments, missing {missing:?}")]
    IncompleteResultSet { expected: usize, missing: Vec<usize> },

    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("{collection} record not found: {key}")]
    NotFound { collection: String, key: String },

    #[error("timed out after {waited_ms} ms waiting for {what}")]
    LookupTimeout { what: String, waited_ms: u64 },

    #[error("revision conflict in {collection}: expected {expected}, found {found}")]
    RevisionConflict {
        collection: String,
        expected: u64,
        found: u64,
    },

    #[error("job cancelled")]
    Cancelled,

    #[error("job exceeded its deadline after {elapsed_ms} ms")]
    TimedOut { elapsed_ms: u64 },

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TimbreError {
    /// Shorthand for the fetch-failure variant used by every blob/HTTP path.
    pub fn fetch(uri: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::UpstreamFetch {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    pub fn incomplete_artifact(model_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ArtifactIncomplete {
            model_id: model_id.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TimbreError>;
