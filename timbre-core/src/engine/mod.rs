//! `ConversionEngine`: top-level lifecycle controller and job intake.
//!
//! ## Lifecycle
//!
//! ```text
//! ConversionEngine::new(config, services)
//!     └─► start()        → dispatcher spawned on the blocking pool
//!         ├─► enqueue()  → job record written, job queued, ack returned
//!         └─► stop()     → running=false, dispatcher exits, diagnostics logged
//! ```
//!
//! `start()`/`stop()` return an error when called in the wrong state.
//! Jobs may be enqueued before `start()`; they wait in the queue.
//!
//! ## Threading
//!
//! The queue is an unbounded `crossbeam-channel`. One dispatcher thread pulls
//! jobs in FIFO order and hands each to the blocking pool once a semaphore
//! permit is free, so at most `pool_capacity` jobs run at once. Remote calls,
//! blob transfers and document writes inside a job are plain blocking calls.

pub mod cancel;
pub mod job;
pub mod pipeline;
pub mod pool;

use std::{
    collections::HashMap,
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};
use tracing::{info, warn};

pub use cancel::CancelToken;
pub use pipeline::{DiagnosticsSnapshot, PipelineDiagnostics};

use crate::{
    artifact::ArtifactSuffixes,
    error::{Result, TimbreError},
    events::{JobEvent, JobProgress, JobStatus},
    inference::{ConversionParams, InferenceHandle},
    pitch::{PitchConvention, SilentSegmentPolicy},
    segment::SegmenterConfig,
    store::{BlobStore, DocumentStore, ModelRepository, RetryPolicy},
};
use job::{Job, JobAck, JobRequest};

/// Broadcast channel capacity: events buffered for slow subscribers.
const BROADCAST_CAP: usize = 1024;

/// Configuration for `ConversionEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum concurrently running jobs. Default: 50.
    pub pool_capacity: usize,
    /// Rate used for pitch analysis and scoring (Hz). Default: 22050.
    pub analysis_sample_rate: u32,
    pub segmenter: SegmenterConfig,
    /// Pitch values swept when a request leaves the range to the engine.
    pub sweep_pitch_range: RangeInclusive<i32>,
    pub sweep_params: ConversionParams,
    pub remix_params: ConversionParams,
    /// Control value sent for each chunked-remix segment. Default: raw Hz.
    pub chunked_pitch_convention: PitchConvention,
    pub silent_segment_policy: SilentSegmentPolicy,
    /// Per-job deadline, armed when a worker picks the job up.
    pub job_timeout: Option<Duration>,
    /// Backoff for records that may not exist yet.
    pub lookup_retry: RetryPolicy,
    /// Enqueue a score job over every finished sweep.
    pub auto_score_sweeps: bool,
    pub weights_suffix: String,
    pub index_suffix: String,
    /// Where model archives are unpacked. `None` uses the system temp dir.
    pub scratch_dir: Option<std::path::PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 50,
            analysis_sample_rate: 22_050,
            segmenter: SegmenterConfig::default(),
            sweep_pitch_range: -12..=12,
            sweep_params: ConversionParams::sweep(),
            remix_params: ConversionParams::remix(),
            chunked_pitch_convention: PitchConvention::Hz,
            silent_segment_policy: SilentSegmentPolicy::Passthrough,
            job_timeout: None,
            lookup_retry: RetryPolicy::default(),
            auto_score_sweeps: true,
            weights_suffix: ".pth".into(),
            index_suffix: ".index".into(),
            scratch_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn suffixes(&self) -> ArtifactSuffixes {
        ArtifactSuffixes {
            weights: self.weights_suffix.clone(),
            index: self.index_suffix.clone(),
        }
    }
}

/// External collaborators, constructed by the host and injected.
#[derive(Clone)]
pub struct Services {
    pub blobs: Arc<dyn BlobStore>,
    pub inference: InferenceHandle,
    pub documents: Arc<dyn DocumentStore>,
}

/// A job waiting in the queue together with its cancel token.
pub(crate) struct QueuedJob {
    pub job: Job,
    pub cancel: CancelToken,
}

struct LiveJob {
    status: JobStatus,
    cancel: CancelToken,
}

/// Shared intake state: the queue sender, the live-job table and the event
/// channel. Workers hold it too so a job can enqueue follow-up jobs.
pub(crate) struct Intake {
    queue: Sender<QueuedJob>,
    repo: ModelRepository,
    events: broadcast::Sender<JobEvent>,
    seq: AtomicU64,
    live: Mutex<HashMap<String, LiveJob>>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl Intake {
    pub(crate) fn submit(&self, request: JobRequest) -> Result<JobAck> {
        request.validate()?;
        let job = Job::from_request(request);
        self.repo.insert_job(&job.to_record())?;

        let cancel = CancelToken::new();
        self.live.lock().insert(
            job.id.clone(),
            LiveJob {
                status: JobStatus::Queued,
                cancel: cancel.clone(),
            },
        );
        let ack = JobAck {
            job_id: job.id.clone(),
            status: JobStatus::Queued,
            created_at: job.created_at,
        };
        info!(job_id = %job.id, kind = job.kind.name(), model_id = %job.model_id, "job enqueued");
        self.publish(&job, JobStatus::Queued, None, None);
        self.diagnostics.jobs_enqueued.fetch_add(1, Ordering::Relaxed);

        self.queue
            .send(QueuedJob { job, cancel })
            .map_err(|_| TimbreError::Other(anyhow::anyhow!("job queue closed")))?;
        Ok(ack)
    }

    /// Record a status change in the live table and broadcast it.
    pub(crate) fn publish(
        &self,
        job: &Job,
        status: JobStatus,
        progress: Option<JobProgress>,
        detail: Option<String>,
    ) {
        let _ = self.events.send(JobEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            job_id: job.id.clone(),
            model_id: job.model_id.clone(),
            status,
            progress,
            detail,
            at: Utc::now(),
        });
        // Terminal jobs leave the table only after their event is sent.
        let mut live = self.live.lock();
        if status.is_terminal() {
            live.remove(&job.id);
        } else if let Some(entry) = live.get_mut(&job.id) {
            entry.status = status;
        }
    }

    pub(crate) fn repo(&self) -> &ModelRepository {
        &self.repo
    }
}

/// The top-level engine handle.
///
/// `ConversionEngine` is `Send + Sync`; wrap it in an `Arc` to share between
/// request handlers.
pub struct ConversionEngine {
    config: EngineConfig,
    services: Services,
    intake: Arc<Intake>,
    queue_rx: Receiver<QueuedJob>,
    /// `true` while the dispatcher is active.
    running: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    held: Arc<Mutex<Option<QueuedJob>>>,
    permits: Arc<Semaphore>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl ConversionEngine {
    /// Create a new engine. Does not dispatch anything until `start()`.
    pub fn new(config: EngineConfig, services: Services) -> Self {
        let (queue_tx, queue_rx) = unbounded();
        let (events, _) = broadcast::channel(BROADCAST_CAP);
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let repo = ModelRepository::new(services.documents.clone(), config.lookup_retry.clone());
        let intake = Arc::new(Intake {
            queue: queue_tx,
            repo,
            events,
            seq: AtomicU64::new(0),
            live: Mutex::new(HashMap::new()),
            diagnostics: diagnostics.clone(),
        });

        Self {
            permits: Arc::new(Semaphore::new(config.pool_capacity.max(1))),
            config,
            services,
            intake,
            queue_rx,
            running: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            held: Arc::new(Mutex::new(None)),
            diagnostics,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the dispatcher. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// - `TimbreError::AlreadyRunning` if already started.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TimbreError::AlreadyRunning);
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(TimbreError::Other(anyhow::anyhow!(
                    "engine must start inside a tokio runtime: {e}"
                )));
            }
        };

        let worker = Arc::new(pipeline::Worker::new(
            self.config.clone(),
            self.services.clone(),
            self.intake.clone(),
            self.diagnostics.clone(),
        ));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = pool::DispatchContext {
            queue: self.queue_rx.clone(),
            held: Arc::clone(&self.held),
            running: Arc::clone(&self.running),
            current: Arc::clone(&self.generation),
            generation,
            permits: Arc::clone(&self.permits),
            runtime: runtime.clone(),
            worker,
        };
        runtime.spawn_blocking(move || pool::run(ctx));

        info!(capacity = self.config.pool_capacity, generation, "conversion engine started");
        Ok(())
    }

    /// Stop dispatching. Jobs already running finish on their own.
    ///
    /// # Errors
    /// - `TimbreError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(TimbreError::NotRunning);
        }
        let snapshot = self.diagnostics.snapshot();
        info!(?snapshot, "conversion engine stop requested");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validate and queue a job. Returns immediately.
    pub fn enqueue(&self, request: JobRequest) -> Result<JobAck> {
        self.intake.submit(request)
    }

    /// Request cancellation of a queued or running job.
    ///
    /// A queued job fails when dispatched; a running job fails at its next
    /// remote-call boundary.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        let live = self.intake.live.lock();
        match live.get(job_id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(job_id, "cancellation requested");
                Ok(())
            }
            None => {
                warn!(job_id, "cancel for unknown or finished job");
                Err(TimbreError::NotFound {
                    collection: crate::store::repository::JOBS.into(),
                    key: job_id.into(),
                })
            }
        }
    }

    /// Current status: the live table for active jobs, the job record
    /// otherwise.
    pub fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        if let Some(entry) = self.intake.live.lock().get(job_id) {
            return Ok(Some(entry.status));
        }
        Ok(self.intake.repo.find_job(job_id)?.map(|r| r.status))
    }

    pub fn repository(&self) -> &ModelRepository {
        self.intake.repo()
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.intake.events.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}
