#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use timbre_core::{
    engine::job::{JobKind, JobRequest, ReferenceSource},
    store::{ModelRecord, RetryPolicy},
    ConversionEngine, EngineConfig, InferenceBackend, InferenceHandle, JobStatus, MemoryBlobStore,
    MemoryDocumentStore, ModelRepository, Services, Waveform,
};

pub const RATE: u32 = 22_050;

pub struct Harness {
    pub blobs: Arc<MemoryBlobStore>,
    pub docs: Arc<MemoryDocumentStore>,
    pub engine: ConversionEngine,
}

impl Harness {
    pub fn repo(&self) -> &ModelRepository {
        self.engine.repository()
    }

    /// Store `waveform` as a WAV blob and return its URI.
    pub fn upload(&self, path: &str, waveform: &Waveform) -> String {
        use timbre_core::BlobStore;
        self.blobs.put(path, waveform.to_wav_bytes().unwrap()).unwrap()
    }

    /// Store a zipped model and a model record pointing at it.
    pub fn add_archived_model(&self, model_id: &str, files: &[(&str, &[u8])]) {
        use timbre_core::BlobStore;
        let uri = self
            .blobs
            .put(&format!("models/{model_id}/model.zip"), zip_bytes(files))
            .unwrap();
        self.repo()
            .insert_model(&ModelRecord {
                id: model_id.into(),
                file_urls: vec![uri],
                ..Default::default()
            })
            .unwrap();
    }

    /// Model record with a flat weights + index list.
    pub fn add_flat_model(&self, model_id: &str) {
        self.repo()
            .insert_model(&ModelRecord {
                id: model_id.into(),
                file_urls: vec![
                    format!("mem://models/{model_id}/model.pth"),
                    format!("mem://models/{model_id}/model.index"),
                ],
                ..Default::default()
            })
            .unwrap();
    }

    pub fn enqueue(&self, kind: JobKind, model_id: &str, reference: &str) -> String {
        self.engine
            .enqueue(JobRequest::new(
                kind,
                model_id,
                ReferenceSource::Uri(reference.into()),
            ))
            .unwrap()
            .job_id
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait(&self, job_id: &str) -> JobStatus {
        let deadline = Instant::now() + Duration::from_secs(60);
        loop {
            if let Some(status) = self.engine.job_status(job_id).unwrap() {
                if status.is_terminal() {
                    return status;
                }
            }
            assert!(Instant::now() < deadline, "job {job_id} did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        lookup_retry: RetryPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            timeout: Duration::from_millis(200),
        },
        ..EngineConfig::default()
    }
}

/// Engine over in-memory stores. `backend` receives the shared blob store.
pub fn harness<B, F>(config: EngineConfig, backend: F) -> Harness
where
    B: InferenceBackend,
    F: FnOnce(Arc<MemoryBlobStore>) -> B,
{
    let blobs = Arc::new(MemoryBlobStore::new());
    let docs = Arc::new(MemoryDocumentStore::new());
    let engine = ConversionEngine::new(
        config,
        Services {
            blobs: blobs.clone(),
            inference: InferenceHandle::new(backend(blobs.clone())),
            documents: docs.clone(),
        },
    );
    Harness {
        blobs,
        docs,
        engine,
    }
}

pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut w = zip::ZipWriter::new(Cursor::new(&mut out));
        let opts = zip::write::SimpleFileOptions::default();
        for (name, data) in files {
            w.start_file(*name, opts).unwrap();
            w.write_all(data).unwrap();
        }
        w.finish().unwrap();
    }
    out
}

pub fn tone(freq: f32, amp: f32, secs: f32) -> Vec<f32> {
    let n = (RATE as f32 * secs) as usize;
    (0..n)
        .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / RATE as f32).sin())
        .collect()
}

pub fn silence(secs: f32) -> Vec<f32> {
    vec![0.0; (RATE as f32 * secs) as usize]
}

pub fn waveform(parts: &[Vec<f32>]) -> Waveform {
    Waveform::new(parts.concat(), RATE)
}
