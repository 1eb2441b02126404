//! # timbre-core
//!
//! Asynchronous voice-conversion pipeline SDK: job queue, model artifact
//! resolution, silence segmentation, pitch estimation, remote conversion,
//! reassembly and spectral quality scoring.
//!
//! ## Architecture
//!
//! ```text
//! enqueue(JobRequest) → crossbeam queue → dispatcher ─(semaphore)─► worker (spawn_blocking)
//!                                                                      │
//!                                          ArtifactResolver ◄──────────┤
//!                                          Segmenter / PitchEstimator ◄┤
//!                                          ConversionInvoker ◄─────────┤ InferenceBackend
//!                                          Reassembler ◄───────────────┤ BlobStore
//!                                          QualityScorer ◄─────────────┘ DocumentStore
//!                                                                      │
//!                                                 broadcast::Sender<JobEvent>
//! ```
//!
//! External services (blob storage, document store, inference) are traits
//! injected through [`engine::Services`]; in-memory implementations ship for
//! tests and local runs.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod artifact;
pub mod audio;
pub mod convert;
pub mod engine;
pub mod error;
pub mod events;
pub mod inference;
pub mod pitch;
pub mod reassemble;
pub mod score;
pub mod segment;
pub mod spectral;
pub mod store;

// Convenience re-exports for downstream crates
pub use audio::Waveform;
pub use engine::{
    job::{JobAck, JobKind, JobOutcome, JobRecord, JobRequest, ReferenceSource},
    CancelToken, ConversionEngine, EngineConfig, Services,
};
pub use error::{Result, TimbreError};
pub use events::{JobEvent, JobProgress, JobStatus};
pub use inference::{InferenceBackend, InferenceHandle, StubBackend};
pub use store::{
    BlobStore, DocumentStore, FsBlobStore, MemoryBlobStore, MemoryDocumentStore, ModelRepository,
};

#[cfg(feature = "http")]
pub use inference::HttpInferenceClient;
