//! Per-job execution.
//!
//! ## Stages
//!
//! ```text
//! 1. Mark running, arm the deadline, open the job span
//! 2. Wait (bounded) for the model record, resolve its artifact
//! 3. Load the reference (direct URI or reference-artist stem)
//! 4. Kind-specific work:
//!    full-pitch-sweep  one whole-reference conversion per pitch value
//!    single-reference  one conversion, pitch given or estimated
//!    remix             one conversion, raw-Hz pitch, remix preset
//!    chunked-remix     [separate] → segment → per-segment Hz pitch + convert
//!                      → reassemble → [overlay background]
//!    score             fetch candidates → score → write model record
//!    separate          vocal + background stems, no model involved
//! 5. Persist the outcome on the job record and broadcast the final status
//! ```
//!
//! Every step runs on the worker's blocking thread. Errors end the job and
//! are recorded; nothing here retries.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Instant;

use tracing::{debug, error, info, info_span, warn};

use super::{
    job::{Job, JobKind, JobOutcome, JobRequest, PitchCandidate, ReferenceSource},
    CancelToken, EngineConfig, Intake, Services,
};
use crate::{
    artifact::{ArtifactResolver, ModelArtifact},
    audio::{overlay, Waveform},
    convert::{ConversionInvoker, InferenceResult, InvocationContext},
    error::{Result, TimbreError},
    events::{JobProgress, JobStatus},
    inference::{AudioRef, Stem},
    pitch::{PitchConvention, PitchEstimator, SilentSegmentPolicy},
    reassemble::Reassembler,
    score::{Candidate, QualityScorer},
    segment::{Segment, Segmenter},
    store::{paths, BlobStore, ModelRepository},
};

// ── Diagnostics ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub jobs_enqueued: AtomicUsize,
    pub jobs_started: AtomicUsize,
    pub jobs_succeeded: AtomicUsize,
    pub jobs_failed: AtomicUsize,
    pub running: AtomicUsize,
    pub peak_running: AtomicUsize,
    pub segments_converted: AtomicUsize,
    pub remote_failures: AtomicUsize,
    pub passthrough_segments: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            peak_running: self.peak_running.load(Ordering::Relaxed),
            segments_converted: self.segments_converted.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            passthrough_segments: self.passthrough_segments.load(Ordering::Relaxed),
        }
    }

    fn job_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
    }

    fn job_finished(&self, ok: bool) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        if ok {
            self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub jobs_enqueued: usize,
    pub jobs_started: usize,
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
    pub running: usize,
    pub peak_running: usize,
    pub segments_converted: usize,
    pub remote_failures: usize,
    pub passthrough_segments: usize,
}

// ── Worker ───────────────────────────────────────────────────────────────────

/// Everything a job needs, built once per `start()` and shared by all
/// workers.
pub(crate) struct Worker {
    config: EngineConfig,
    blobs: Arc<dyn BlobStore>,
    intake: Arc<Intake>,
    resolver: ArtifactResolver,
    invoker: ConversionInvoker,
    reassembler: Reassembler,
    segmenter: Segmenter,
    estimator: PitchEstimator,
    scorer: QualityScorer,
    diagnostics: Arc<PipelineDiagnostics>,
}

/// The reference recording of a job.
struct Reference {
    waveform: Waveform,
    bytes: Vec<u8>,
}

impl Reference {
    fn audio_ref(&self) -> AudioRef {
        AudioRef::wav("reference.wav", self.bytes.clone())
    }
}

impl Worker {
    pub(crate) fn new(
        config: EngineConfig,
        services: Services,
        intake: Arc<Intake>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        let mut resolver = ArtifactResolver::new(services.blobs.clone(), config.suffixes());
        if let Some(dir) = &config.scratch_dir {
            resolver = resolver.with_scratch_root(dir);
        }
        Self {
            resolver,
            invoker: ConversionInvoker::new(services.inference.clone(), services.blobs.clone()),
            reassembler: Reassembler::new(services.blobs.clone()),
            segmenter: Segmenter::new(config.segmenter.clone()),
            estimator: PitchEstimator::new(config.analysis_sample_rate),
            scorer: QualityScorer::new(config.analysis_sample_rate),
            blobs: services.blobs,
            intake,
            diagnostics,
            config,
        }
    }

    fn repo(&self) -> &ModelRepository {
        self.intake.repo()
    }

    /// Execute one job end to end. Never returns an error: failures are
    /// recorded on the job.
    pub(crate) fn run(&self, job: &Job, cancel: &CancelToken) {
        let span = info_span!("job", job_id = %job.id, kind = job.kind.name());
        let _guard = span.enter();
        let started = Instant::now();

        self.diagnostics.job_started();
        cancel.arm(self.config.job_timeout);
        self.set_status(job, JobStatus::Running, None, None);
        self.intake.publish(job, JobStatus::Running, None, None);
        info!(model_id = %job.model_id, "job started");

        let result = cancel.check().and_then(|()| self.execute(job, cancel));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(outcome) => {
                self.diagnostics.job_finished(true);
                info!(elapsed_ms, output = ?outcome.primary_uri(), "job done");
                self.set_status(job, JobStatus::Done, None, Some(&outcome));
                self.intake.publish(
                    job,
                    JobStatus::Done,
                    None,
                    outcome.primary_uri().map(str::to_string),
                );
            }
            Err(e) => {
                self.diagnostics.job_finished(false);
                if matches!(e, TimbreError::RemoteInference(_)) {
                    self.diagnostics.remote_failures.fetch_add(1, Ordering::Relaxed);
                }
                error!(elapsed_ms, error = %e, "job failed");
                let msg = e.to_string();
                self.set_status(job, JobStatus::Failed, Some(&msg), None);
                self.intake.publish(job, JobStatus::Failed, None, Some(msg));
            }
        }
    }

    /// Record a job that panicked inside `run`.
    pub(crate) fn fail_after_panic(&self, job: &Job, message: &str) {
        self.diagnostics.job_finished(false);
        let msg = format!("worker panicked: {message}");
        self.set_status(job, JobStatus::Failed, Some(&msg), None);
        self.intake.publish(job, JobStatus::Failed, None, Some(msg));
    }

    fn set_status(&self, job: &Job, status: JobStatus, error: Option<&str>, outcome: Option<&JobOutcome>) {
        if let Err(e) = self.repo().update_job(&job.id, status, error, outcome) {
            warn!(job_id = %job.id, %status, error = %e, "job record update failed");
        }
    }

    fn execute(&self, job: &Job, cancel: &CancelToken) -> Result<JobOutcome> {
        let ctx = InvocationContext {
            job_id: job.id.clone(),
            model_id: job.model_id.clone(),
            cancel: cancel.clone(),
        };
        match &job.kind {
            JobKind::FullPitchSweep {
                pitch_min,
                pitch_max,
            } => self.pitch_sweep(job, &ctx, *pitch_min, *pitch_max),
            JobKind::SingleReference { pitch } => self.single_reference(job, &ctx, *pitch),
            JobKind::Remix => self.remix(job, &ctx),
            JobKind::ChunkedRemix { separate_stems } => self.chunked_remix(job, &ctx, *separate_stems),
            JobKind::Score { candidate_uris } => self.score(job, &ctx, candidate_uris),
            JobKind::Separate => self.split(job, &ctx),
        }
    }

    // ── Shared steps ─────────────────────────────────────────────────────────

    fn resolve_model(&self, job: &Job, cancel: &CancelToken) -> Result<ModelArtifact> {
        let model = self.repo().wait_for_model(&job.model_id, cancel)?;
        self.resolver
            .resolve(&model.id, &model.file_urls, model.archive_index)
    }

    fn load_reference(&self, job: &Job, cancel: &CancelToken) -> Result<Reference> {
        let uri = match &job.reference {
            ReferenceSource::Uri(uri) => uri.clone(),
            ReferenceSource::ArtistId(artist) => self.repo().wait_for_reference_stem(artist, cancel)?,
        };
        cancel.check()?;
        let bytes = self.blobs.get(&uri)?;
        let waveform = Waveform::from_wav_bytes(&bytes)?;
        debug!(uri = %uri, duration_ms = waveform.duration_ms(), "reference loaded");
        Ok(Reference { waveform, bytes })
    }

    fn progress(&self, job: &Job, completed: usize, total: usize) {
        self.intake.publish(
            job,
            JobStatus::Running,
            Some(JobProgress { completed, total }),
            None,
        );
    }

    // ── 1. Full pitch sweep ──────────────────────────────────────────────────

    fn pitch_sweep(
        &self,
        job: &Job,
        ctx: &InvocationContext,
        pitch_min: i32,
        pitch_max: i32,
    ) -> Result<JobOutcome> {
        let artifact = self.resolve_model(job, &ctx.cancel)?;
        let reference = self.load_reference(job, &ctx.cancel)?;
        let whole = Segment::whole(reference.waveform);
        let total = (pitch_max - pitch_min + 1) as usize;

        let mut candidates = Vec::with_capacity(total);
        for (done, pitch) in (pitch_min..=pitch_max).enumerate() {
            let result = self.invoker.convert_segment(
                ctx,
                &whole,
                &artifact,
                pitch as f32,
                &self.config.sweep_params,
            )?;
            self.diagnostics.segments_converted.fetch_add(1, Ordering::Relaxed);
            debug!(pitch, uri = %result.output_uri, "sweep variant stored");
            candidates.push(PitchCandidate {
                pitch,
                uri: result.output_uri,
            });
            self.progress(job, done + 1, total);
        }

        let uris: Vec<String> = candidates.iter().map(|c| c.uri.clone()).collect();
        self.repo().record_candidates(&job.model_id, &uris)?;

        let score_job_id = if self.config.auto_score_sweeps {
            let ack = self.intake.submit(JobRequest::new(
                JobKind::Score {
                    candidate_uris: uris,
                },
                job.model_id.clone(),
                job.reference.clone(),
            ))?;
            info!(score_job_id = %ack.job_id, "score job enqueued for sweep");
            Some(ack.job_id)
        } else {
            None
        };

        Ok(JobOutcome::PitchSweep {
            candidates,
            score_job_id,
        })
    }

    // ── 2. Single reference ──────────────────────────────────────────────────

    fn single_reference(
        &self,
        job: &Job,
        ctx: &InvocationContext,
        pitch: Option<f32>,
    ) -> Result<JobOutcome> {
        let artifact = self.resolve_model(job, &ctx.cancel)?;
        let reference = self.load_reference(job, &ctx.cancel)?;

        let pitch = match pitch {
            Some(p) => p,
            None => {
                let estimate = self.estimator.estimate(&reference.waveform)?;
                estimate
                    .control_value(PitchConvention::SemitoneOffset)
                    .unwrap_or_else(|| {
                        warn!("reference is silent, converting at offset 0");
                        0.0
                    })
            }
        };

        let result = self.invoker.convert_segment(
            ctx,
            &Segment::whole(reference.waveform),
            &artifact,
            pitch,
            &self.config.sweep_params,
        )?;
        self.diagnostics.segments_converted.fetch_add(1, Ordering::Relaxed);
        Ok(JobOutcome::SingleReference {
            output_uri: result.output_uri,
            pitch,
        })
    }

    // ── 3. Remix ─────────────────────────────────────────────────────────────

    fn remix(&self, job: &Job, ctx: &InvocationContext) -> Result<JobOutcome> {
        let artifact = self.resolve_model(job, &ctx.cancel)?;
        let reference = self.load_reference(job, &ctx.cancel)?;
        let path = paths::remix(&job.id, &job.model_id);

        let estimate = self.estimator.estimate(&reference.waveform)?;
        let Some(pitch_hz) = estimate.control_value(PitchConvention::Hz) else {
            warn!("reference is silent, storing it unconverted");
            ctx.cancel.check()?;
            let output_uri = self.blobs.put(&path, reference.bytes)?;
            self.diagnostics.passthrough_segments.fetch_add(1, Ordering::Relaxed);
            return Ok(JobOutcome::Remix {
                output_uri,
                pitch_hz: None,
            });
        };

        let output_uri = self.invoker.convert_to(
            ctx,
            reference.audio_ref(),
            &artifact,
            pitch_hz,
            &self.config.remix_params,
            &path,
        )?;
        self.diagnostics.segments_converted.fetch_add(1, Ordering::Relaxed);
        Ok(JobOutcome::Remix {
            output_uri,
            pitch_hz: Some(pitch_hz),
        })
    }

    // ── 4. Chunked remix ─────────────────────────────────────────────────────

    fn chunked_remix(
        &self,
        job: &Job,
        ctx: &InvocationContext,
        separate_stems: bool,
    ) -> Result<JobOutcome> {
        let artifact = self.resolve_model(job, &ctx.cancel)?;
        let reference = self.load_reference(job, &ctx.cancel)?;

        let (vocal, background) = if separate_stems {
            let (_, vocal) = self.invoker.separate(ctx, reference.audio_ref(), Stem::Vocal, true)?;
            let (_, background) =
                self.invoker
                    .separate(ctx, reference.audio_ref(), Stem::Background, false)?;
            (vocal, Some(background))
        } else {
            (reference.waveform, None)
        };

        if vocal.is_empty() {
            return Err(TimbreError::InvalidAudio("vocal track is empty".into()));
        }

        let segments = self.segmenter.segments(&vocal);
        let total = segments.len();
        info!(segments = total, duration_ms = vocal.duration_ms(), "vocal segmented");

        let mut results: Vec<InferenceResult> = Vec::with_capacity(total);
        let mut passthrough = 0;
        for (done, segment) in segments.enumerate() {
            let estimate = self.estimator.estimate(&segment.waveform)?;
            let pitch = match (
                estimate.control_value(self.config.chunked_pitch_convention),
                self.config.silent_segment_policy,
            ) {
                (Some(p), _) => Some(p),
                (None, SilentSegmentPolicy::ZeroOffset) => Some(0.0),
                (None, SilentSegmentPolicy::Passthrough) => None,
            };

            let result = match pitch {
                Some(p) => {
                    let r = self.invoker.convert_segment(
                        ctx,
                        &segment,
                        &artifact,
                        p,
                        &self.config.remix_params,
                    )?;
                    self.diagnostics.segments_converted.fetch_add(1, Ordering::Relaxed);
                    r
                }
                None => {
                    passthrough += 1;
                    self.diagnostics.passthrough_segments.fetch_add(1, Ordering::Relaxed);
                    self.invoker.passthrough(ctx, &segment)?
                }
            };
            debug!(segment = segment.index, pitch = ?pitch, "segment done");
            results.push(result);
            self.progress(job, done + 1, total);
        }

        ctx.cancel.check()?;
        let (vocal_uri, track) =
            self.reassembler
                .assemble_to(results, total, &paths::assembled(&job.id, &job.model_id))?;

        let mixed_uri = match background {
            Some(background) => {
                let mixed = overlay(&track, &background)?;
                ctx.cancel.check()?;
                Some(
                    self.blobs
                        .put(&paths::mixed(&job.id, &job.model_id), mixed.to_wav_bytes()?)?,
                )
            }
            None => None,
        };

        Ok(JobOutcome::ChunkedRemix {
            vocal_uri,
            mixed_uri,
            segments: total,
            passthrough_segments: passthrough,
        })
    }

    // ── 5. Score ─────────────────────────────────────────────────────────────

    fn score(&self, job: &Job, ctx: &InvocationContext, candidate_uris: &[String]) -> Result<JobOutcome> {
        self.repo().wait_for_model(&job.model_id, &ctx.cancel)?;
        let reference = self.load_reference(job, &ctx.cancel)?;

        let mut candidates = Vec::with_capacity(candidate_uris.len());
        for uri in candidate_uris {
            ctx.cancel.check()?;
            let waveform = Waveform::from_wav_bytes(&self.blobs.get(uri)?)?;
            candidates.push(Candidate::new(Some(uri.clone()), waveform));
        }

        let report = self.scorer.score(&reference.waveform, &candidates)?;
        ctx.cancel.check()?;
        self.repo().record_score(&job.model_id, &report)?;
        info!(
            best = ?report.best_uri,
            similarity = report.score.similarity,
            snr = report.score.snr,
            composite = report.score.composite,
            "model scored"
        );
        Ok(JobOutcome::Score { report })
    }

    // ── 6. Separate ──────────────────────────────────────────────────────────

    fn split(&self, job: &Job, ctx: &InvocationContext) -> Result<JobOutcome> {
        let reference = self.load_reference(job, &ctx.cancel)?;
        let track = &job.model_id;

        let (vocal_uri, _) = self.invoker.separate_to(
            ctx,
            reference.audio_ref(),
            Stem::Vocal,
            false,
            &paths::split(track, Stem::Vocal),
        )?;
        self.progress(job, 1, 2);
        let (background_uri, _) = self.invoker.separate_to(
            ctx,
            reference.audio_ref(),
            Stem::Background,
            false,
            &paths::split(track, Stem::Background),
        )?;
        self.progress(job, 2, 2);

        info!(track = %track, vocal = %vocal_uri, background = %background_uri, "stems stored");
        Ok(JobOutcome::Separate {
            vocal_uri,
            background_uri,
        })
    }
}
