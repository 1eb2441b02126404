//! External storage seams: blob storage, the document store, and the typed
//! repository the pipeline uses on top of it.
//!
//! Both stores are traits so the host can wire real backends while tests
//! run against the in-memory implementations.

pub mod blob;
pub mod document;
pub mod repository;
pub mod retry;

pub use blob::{paths, BlobStore, FsBlobStore, MemoryBlobStore};
pub use document::{DocumentStore, MemoryDocumentStore};
pub use repository::{ModelRecord, ModelRepository, ReferenceArtistRecord};
pub use retry::RetryPolicy;
