//! Job descriptions, persisted job records and job outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TimbreError},
    events::JobStatus,
    score::ScoreReport,
};

/// Widest pitch control value a sweep may request, in either direction.
pub const MAX_SWEEP_PITCH: i32 = 48;

/// What a job does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum JobKind {
    /// Convert the whole reference once per integer pitch in
    /// `pitch_min..=pitch_max`; every variant is persisted.
    FullPitchSweep { pitch_min: i32, pitch_max: i32 },
    /// Convert the whole reference once. `None` estimates the pitch as a
    /// semitone offset from the reference itself.
    SingleReference {
        #[serde(default)]
        pitch: Option<f32>,
    },
    /// Whole-reference conversion with the remix preset and a raw-Hz pitch.
    Remix,
    /// Silence-chunked conversion with per-segment pitch, optionally on a
    /// separated vocal stem mixed back over the background.
    ChunkedRemix {
        #[serde(default)]
        separate_stems: bool,
    },
    /// Score candidates against the reference and write the result to the
    /// model record.
    Score { candidate_uris: Vec<String> },
    /// Split the reference into vocal and background stems, stored under the
    /// job's `model_id` used as a track key. No model record is read.
    Separate,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::FullPitchSweep { .. } => "full-pitch-sweep",
            JobKind::SingleReference { .. } => "single-reference",
            JobKind::Remix => "remix",
            JobKind::ChunkedRemix { .. } => "chunked-remix",
            JobKind::Score { .. } => "score",
            JobKind::Separate => "separate",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            JobKind::FullPitchSweep {
                pitch_min,
                pitch_max,
            } => {
                if pitch_min > pitch_max {
                    return Err(TimbreError::InvalidJob(format!(
                        "pitch range {pitch_min}..={pitch_max} is empty"
                    )));
                }
                if pitch_min.abs() > MAX_SWEEP_PITCH || pitch_max.abs() > MAX_SWEEP_PITCH {
                    return Err(TimbreError::InvalidJob(format!(
                        "pitch range {pitch_min}..={pitch_max} exceeds ±{MAX_SWEEP_PITCH}"
                    )));
                }
            }
            JobKind::SingleReference { pitch: Some(p) } if !p.is_finite() => {
                return Err(TimbreError::InvalidJob("pitch must be finite".into()));
            }
            JobKind::Score { candidate_uris } if candidate_uris.is_empty() => {
                return Err(TimbreError::InvalidJob(
                    "score job needs at least one candidate".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Where the reference recording comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferenceSource {
    /// A direct blob URI.
    Uri(String),
    /// A reference-artist record whose `audioStemUrl` names the recording.
    ArtistId(String),
}

/// Intake payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub kind: JobKind,
    pub model_id: String,
    pub reference: ReferenceSource,
}

impl JobRequest {
    pub fn new(kind: JobKind, model_id: impl Into<String>, reference: ReferenceSource) -> Self {
        Self {
            kind,
            model_id: model_id.into(),
            reference,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(TimbreError::InvalidJob("modelId is required".into()));
        }
        match &self.reference {
            ReferenceSource::Uri(u) | ReferenceSource::ArtistId(u) if u.trim().is_empty() => {
                return Err(TimbreError::InvalidJob("reference is empty".into()));
            }
            _ => {}
        }
        self.kind.validate()
    }
}

/// One unit of work, owned by exactly one worker once dispatched.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub model_id: String,
    pub reference: ReferenceSource,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
}

impl Job {
    pub fn from_request(request: JobRequest) -> Self {
        Self {
            id: new_id("job"),
            kind: request.kind,
            model_id: request.model_id,
            reference: request.reference,
            created_at: Utc::now(),
            status: JobStatus::Queued,
        }
    }

    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id.clone(),
            kind: self.kind.clone(),
            model_id: self.model_id.clone(),
            reference: self.reference.clone(),
            status: self.status,
            created_at: self.created_at,
            updated_at: Utc::now(),
            error: None,
            outcome: None,
            revision: 0,
        }
    }
}

/// A job as stored in the `jobs` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    pub model_id: String,
    pub reference: ReferenceSource,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub outcome: Option<JobOutcome>,
    #[serde(default)]
    pub revision: u64,
}

/// One persisted pitch variant of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PitchCandidate {
    pub pitch: i32,
    pub uri: String,
}

/// What a finished job produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum JobOutcome {
    PitchSweep {
        candidates: Vec<PitchCandidate>,
        score_job_id: Option<String>,
    },
    SingleReference {
        output_uri: String,
        pitch: f32,
    },
    Remix {
        output_uri: String,
        pitch_hz: Option<f32>,
    },
    ChunkedRemix {
        vocal_uri: String,
        mixed_uri: Option<String>,
        segments: usize,
        passthrough_segments: usize,
    },
    Score {
        report: ScoreReport,
    },
    Separate {
        vocal_uri: String,
        background_uri: String,
    },
}

impl JobOutcome {
    /// The main output URI, for event detail lines.
    pub fn primary_uri(&self) -> Option<&str> {
        match self {
            JobOutcome::PitchSweep { .. } => None,
            JobOutcome::SingleReference { output_uri, .. } | JobOutcome::Remix { output_uri, .. } => {
                Some(output_uri.as_str())
            }
            JobOutcome::ChunkedRemix {
                vocal_uri,
                mixed_uri,
                ..
            } => Some(mixed_uri.as_deref().unwrap_or(vocal_uri)),
            JobOutcome::Score { report } => report.best_uri.as_deref(),
            JobOutcome::Separate { vocal_uri, .. } => Some(vocal_uri.as_str()),
        }
    }
}

/// Returned by `enqueue`; the result itself is only observable by polling
/// the job record or subscribing to events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAck {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

pub fn new_id(prefix: &str) -> String {
    format!(
        "{prefix}-{}-{:08x}",
        Utc::now().timestamp_micros(),
        rand::random::<u32>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_kind_wire_format() {
        let kind = JobKind::FullPitchSweep {
            pitch_min: -12,
            pitch_max: 12,
        };
        let v = serde_json::to_value(&kind).unwrap();
        assert_eq!(v, json!({"type": "full-pitch-sweep", "pitchMin": -12, "pitchMax": 12}));

        let parsed: JobKind =
            serde_json::from_value(json!({"type": "chunked-remix", "separateStems": true})).unwrap();
        assert_eq!(parsed, JobKind::ChunkedRemix { separate_stems: true });

        let parsed: JobKind = serde_json::from_value(json!({"type": "single-reference"})).unwrap();
        assert_eq!(parsed, JobKind::SingleReference { pitch: None });

        let parsed: JobKind = serde_json::from_value(json!({"type": "separate"})).unwrap();
        assert_eq!(parsed, JobKind::Separate);
        assert_eq!(parsed.name(), "separate");
    }

    #[test]
    fn request_wire_format() {
        let req: JobRequest = serde_json::from_value(json!({
            "kind": {"type": "remix"},
            "modelId": "m1",
            "reference": {"artistId": "spotify:123"}
        }))
        .unwrap();
        assert_eq!(req.kind, JobKind::Remix);
        assert_eq!(req.reference, ReferenceSource::ArtistId("spotify:123".into()));
        req.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_requests() {
        let empty_range = JobKind::FullPitchSweep {
            pitch_min: 3,
            pitch_max: -3,
        };
        assert!(empty_range.validate().is_err());
        let huge = JobKind::FullPitchSweep {
            pitch_min: -100,
            pitch_max: 0,
        };
        assert!(huge.validate().is_err());
        assert!(JobKind::Score { candidate_uris: vec![] }.validate().is_err());

        let no_model = JobRequest::new(JobKind::Remix, " ", ReferenceSource::Uri("mem://r".into()));
        assert!(no_model.validate().is_err());
        let no_ref = JobRequest::new(JobKind::Remix, "m1", ReferenceSource::Uri(String::new()));
        assert!(no_ref.validate().is_err());
    }

    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = new_id("job");
        let b = new_id("job");
        assert!(a.starts_with("job-"));
        assert_ne!(a, b);
    }

    #[test]
    fn record_round_trips_through_json() {
        let job = Job::from_request(JobRequest::new(
            JobKind::SingleReference { pitch: Some(2.0) },
            "m1",
            ReferenceSource::Uri("mem://ref.wav".into()),
        ));
        let mut record = job.to_record();
        record.outcome = Some(JobOutcome::SingleReference {
            output_uri: "mem://out.wav".into(),
            pitch: 2.0,
        });
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["status"], "queued");
        assert_eq!(v["outcome"]["type"], "single-reference");
        assert_eq!(v["outcome"]["outputUri"], "mem://out.wav");
        let back: JobRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back.outcome, record.outcome);
    }
}
