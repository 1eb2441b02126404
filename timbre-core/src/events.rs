//! Job lifecycle events broadcast to engine subscribers.
//!
//! All types serialise camelCase with lowercase enum values so the host can
//! forward them verbatim (the intake service logs them and mirrors status
//! into job records).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job state. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted on every job status change and for per-segment progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub job_id: String,
    pub model_id: String,
    pub status: JobStatus,
    pub progress: Option<JobProgress>,
    /// Error message for failed jobs, output URI for finished ones.
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Completed units of work within a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub completed: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_event_serializes_with_camel_case_and_lowercase_status() {
        let event = JobEvent {
            seq: 4,
            job_id: "job-1".into(),
            model_id: "m1".into(),
            status: JobStatus::Running,
            progress: Some(JobProgress {
                completed: 3,
                total: 25,
            }),
            detail: None,
            at: Utc::now(),
        };

        let json = serde_json::to_value(&event).expect("serialize job event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["jobId"], "job-1");
        assert_eq!(json["modelId"], "m1");
        assert_eq!(json["status"], "running");
        assert_eq!(json["progress"]["completed"], 3);

        let round_trip: JobEvent = serde_json::from_value(json).expect("deserialize job event");
        assert_eq!(round_trip.status, JobStatus::Running);
        assert_eq!(round_trip.progress.map(|p| p.total), Some(25));
    }

    #[test]
    fn status_rejects_non_lowercase_values() {
        assert!(serde_json::from_str::<JobStatus>(r#""Done""#).is_err());
        assert_eq!(
            serde_json::from_str::<JobStatus>(r#""failed""#).unwrap(),
            JobStatus::Failed
        );
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
