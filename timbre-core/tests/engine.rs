mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use timbre_core::{
    engine::job::{JobKind, JobOutcome},
    inference::{ConversionRequest, SeparationRequest},
    store::MemoryBlobStore,
    InferenceBackend, JobStatus, Result, StubBackend, TimbreError,
};

use common::{harness, test_config, tone, waveform};

/// Stub that sleeps inside every call and records peak concurrency.
struct SlowBackend {
    inner: StubBackend,
    delay: Duration,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl InferenceBackend for SlowBackend {
    fn convert(&self, request: &ConversionRequest) -> Result<Value> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let out = self.inner.convert(request);
        self.current.fetch_sub(1, Ordering::SeqCst);
        out
    }

    fn separate(&self, request: &SeparationRequest) -> Result<Value> {
        self.inner.separate(request)
    }
}

/// Fails conversions whose pitch is negative, panics on pitch 99.
struct Picky(StubBackend);

impl InferenceBackend for Picky {
    fn convert(&self, request: &ConversionRequest) -> Result<Value> {
        if request.pitch == 99.0 {
            panic!("backend exploded");
        }
        if request.pitch < 0.0 {
            return Ok(json!({"error": "negative pitch rejected"}));
        }
        self.0.convert(request)
    }

    fn separate(&self, request: &SeparationRequest) -> Result<Value> {
        self.0.separate(request)
    }
}

/// Stub that records the pitch of each conversion as it starts.
struct Ordered {
    inner: StubBackend,
    delay: Duration,
    order: Arc<Mutex<Vec<f32>>>,
}

impl InferenceBackend for Ordered {
    fn convert(&self, request: &ConversionRequest) -> Result<Value> {
        self.order.lock().push(request.pitch);
        std::thread::sleep(self.delay);
        self.inner.convert(request)
    }

    fn separate(&self, request: &SeparationRequest) -> Result<Value> {
        self.inner.separate(request)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarts_keep_fifo_order_and_a_single_dispatcher() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let config = timbre_core::EngineConfig {
        pool_capacity: 1,
        ..test_config()
    };
    let h = harness(config, move |blobs: Arc<MemoryBlobStore>| Ordered {
        inner: StubBackend::new(blobs),
        delay: Duration::from_millis(40),
        order: seen,
    });
    h.add_flat_model("m1");
    let reference = h.upload("refs/r.wav", &waveform(&[tone(220.0, 0.4, 0.05)]));

    let ids: Vec<String> = (1..=6)
        .map(|p| h.enqueue(JobKind::SingleReference { pitch: Some(p as f32) }, "m1", &reference))
        .collect();
    h.engine.start().unwrap();

    // The first job is running and the second waits for the only permit.
    tokio::time::sleep(Duration::from_millis(15)).await;
    for _ in 0..3 {
        h.engine.stop().unwrap();
        h.engine.start().unwrap();
    }

    for id in &ids {
        assert_eq!(h.wait(id).await, JobStatus::Done);
    }
    assert_eq!(*order.lock(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(h.engine.diagnostics_snapshot().peak_running, 1);
    h.engine.stop().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_admits_at_most_capacity_jobs() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (c, p) = (current.clone(), peak.clone());
    let config = timbre_core::EngineConfig {
        pool_capacity: 50,
        ..test_config()
    };
    let h = harness(config, move |blobs: Arc<MemoryBlobStore>| SlowBackend {
        inner: StubBackend::new(blobs),
        delay: Duration::from_millis(20),
        current: c,
        peak: p,
    });
    h.add_flat_model("m1");
    let reference = h.upload("refs/r.wav", &waveform(&[tone(220.0, 0.4, 0.05)]));

    h.engine.start().unwrap();
    let ids: Vec<String> = (0..200)
        .map(|_| h.enqueue(JobKind::SingleReference { pitch: Some(0.0) }, "m1", &reference))
        .collect();
    for id in &ids {
        assert_eq!(h.wait(id).await, JobStatus::Done);
    }

    let snap = h.engine.diagnostics_snapshot();
    assert_eq!(snap.jobs_enqueued, 200);
    assert_eq!(snap.jobs_succeeded, 200);
    assert!(snap.peak_running <= 50, "peak running {}", snap.peak_running);
    assert!(peak.load(Ordering::SeqCst) <= 50);
    assert!(peak.load(Ordering::SeqCst) > 1, "jobs never overlapped");
    assert_eq!(snap.running, 0);
    h.engine.stop().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failures_stay_inside_their_job() {
    let h = harness(test_config(), |blobs| Picky(StubBackend::new(blobs)));
    h.add_flat_model("m1");
    let reference = h.upload("refs/r.wav", &waveform(&[tone(220.0, 0.4, 0.05)]));
    h.engine.start().unwrap();

    let rejected = h.enqueue(JobKind::SingleReference { pitch: Some(-3.0) }, "m1", &reference);
    let panicked = h.enqueue(JobKind::SingleReference { pitch: Some(99.0) }, "m1", &reference);
    let fine = h.enqueue(JobKind::SingleReference { pitch: Some(2.0) }, "m1", &reference);

    assert_eq!(h.wait(&rejected).await, JobStatus::Failed);
    assert_eq!(h.wait(&panicked).await, JobStatus::Failed);
    assert_eq!(h.wait(&fine).await, JobStatus::Done);

    let rec = h.repo().find_job(&rejected).unwrap().unwrap();
    assert_eq!(
        rec.error.as_deref(),
        Some("remote inference failure: negative pitch rejected")
    );
    let rec = h.repo().find_job(&panicked).unwrap().unwrap();
    assert!(rec.error.unwrap().contains("backend exploded"));
    let rec = h.repo().find_job(&fine).unwrap().unwrap();
    assert_eq!(
        rec.outcome,
        Some(JobOutcome::SingleReference {
            output_uri: format!("mem://conversions/{fine}/m1/seg0000/pitch2.wav"),
            pitch: 2.0,
        })
    );

    let snap = h.engine.diagnostics_snapshot();
    assert_eq!(snap.jobs_failed, 2);
    assert_eq!(snap.remote_failures, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_model_fails_with_lookup_timeout() {
    let h = harness(test_config(), |blobs| StubBackend::new(blobs));
    let reference = h.upload("refs/r.wav", &waveform(&[tone(220.0, 0.4, 0.05)]));
    h.engine.start().unwrap();
    let id = h.enqueue(JobKind::Remix, "ghost", &reference);
    assert_eq!(h.wait(&id).await, JobStatus::Failed);
    let err = h.repo().find_job(&id).unwrap().unwrap().error.unwrap();
    assert!(err.contains("model ghost"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_queued_job_never_converts() {
    let h = harness(test_config(), |blobs| StubBackend::new(blobs));
    h.add_flat_model("m1");
    let reference = h.upload("refs/r.wav", &waveform(&[tone(220.0, 0.4, 0.05)]));

    // Not started yet: the job waits in the queue.
    let id = h.enqueue(JobKind::SingleReference { pitch: Some(0.0) }, "m1", &reference);
    assert_eq!(h.engine.job_status(&id).unwrap(), Some(JobStatus::Queued));
    h.engine.cancel(&id).unwrap();
    h.engine.start().unwrap();

    assert_eq!(h.wait(&id).await, JobStatus::Failed);
    let rec = h.repo().find_job(&id).unwrap().unwrap();
    assert_eq!(rec.error.as_deref(), Some("job cancelled"));
    assert!(h.blobs.paths_with_prefix("conversions/").is_empty());
    assert!(matches!(
        h.engine.cancel(&id),
        Err(TimbreError::NotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn job_timeout_fails_the_job() {
    let config = timbre_core::EngineConfig {
        job_timeout: Some(Duration::from_millis(30)),
        ..test_config()
    };
    let h = harness(config, |blobs| SlowBackend {
        inner: StubBackend::new(blobs),
        delay: Duration::from_millis(20),
        current: Arc::default(),
        peak: Arc::default(),
    });
    h.add_flat_model("m1");
    let reference = h.upload("refs/r.wav", &waveform(&[tone(220.0, 0.4, 0.05)]));
    h.engine.start().unwrap();

    let id = h.enqueue(
        JobKind::FullPitchSweep {
            pitch_min: -12,
            pitch_max: 12,
        },
        "m1",
        &reference,
    );
    assert_eq!(h.wait(&id).await, JobStatus::Failed);
    let err = h.repo().find_job(&id).unwrap().unwrap().error.unwrap();
    assert!(err.contains("deadline"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_and_intake_validation() {
    let h = harness(test_config(), |blobs| StubBackend::new(blobs));
    assert!(matches!(h.engine.stop(), Err(TimbreError::NotRunning)));
    h.engine.start().unwrap();
    assert!(matches!(h.engine.start(), Err(TimbreError::AlreadyRunning)));

    let bad = h.engine.enqueue(timbre_core::JobRequest::new(
        JobKind::FullPitchSweep {
            pitch_min: 5,
            pitch_max: -5,
        },
        "m1",
        timbre_core::ReferenceSource::Uri("mem://r.wav".into()),
    ));
    assert!(matches!(bad, Err(TimbreError::InvalidJob(_))));
    assert_eq!(h.docs.count("jobs"), 0);

    let mut events = h.engine.subscribe();
    h.add_flat_model("m1");
    let reference = h.upload("refs/r.wav", &waveform(&[tone(220.0, 0.4, 0.05)]));
    let id = h.enqueue(JobKind::SingleReference { pitch: Some(1.0) }, "m1", &reference);
    h.wait(&id).await;

    let mut statuses = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if ev.job_id == id {
            statuses.push(ev.status);
        }
    }
    assert_eq!(
        statuses,
        vec![JobStatus::Queued, JobStatus::Running, JobStatus::Done]
    );
    h.engine.stop().unwrap();
}
