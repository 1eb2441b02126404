//! Blob storage: `put(path, bytes) -> uri` and `get(uri) -> bytes`.
//!
//! Paths are hierarchical, `/`-separated and relative (see [`paths`]).
//! Workers hold the store as `Arc<dyn BlobStore>` and call it from blocking
//! threads.

use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, TimbreError};

pub trait BlobStore: Send + Sync + 'static {
    /// Store `bytes` at `path`, replacing any previous object, and return
    /// the object's public URI.
    fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String>;

    /// Fetch the object behind `uri`.
    fn get(&self, uri: &str) -> Result<Vec<u8>>;
}

/// Deterministic object paths. Every path is keyed by job and model so
/// concurrent jobs never write to the same object.
pub mod paths {
    use crate::inference::Stem;

    pub fn conversion(job_id: &str, model_id: &str, segment: usize, pitch_key: &str) -> String {
        format!("conversions/{job_id}/{model_id}/seg{segment:04}/pitch{pitch_key}.wav")
    }

    pub fn passthrough(job_id: &str, model_id: &str, segment: usize) -> String {
        format!("conversions/{job_id}/{model_id}/seg{segment:04}/passthrough.wav")
    }

    pub fn separated(job_id: &str, stem: Stem) -> String {
        format!("separated/{job_id}/{}.wav", stem.as_str())
    }

    pub fn assembled(job_id: &str, model_id: &str) -> String {
        format!("assembled/{job_id}/{model_id}/vocal.wav")
    }

    pub fn mixed(job_id: &str, model_id: &str) -> String {
        format!("assembled/{job_id}/{model_id}/mixed.wav")
    }

    pub fn remix(job_id: &str, model_id: &str) -> String {
        format!("remix/{job_id}/{model_id}/isolated-vocal.wav")
    }

    /// Stems of a separate job, keyed by the track rather than the job.
    pub fn split(track_id: &str, stem: Stem) -> String {
        format!("remix-separated/{track_id}/{}.wav", stem.as_str())
    }

    /// Path-safe rendering of a pitch control value: integers print bare
    /// (`-12`, `0`, `7`), anything else with three decimals.
    pub fn pitch_key(value: f32) -> String {
        if value.fract() == 0.0 && value.abs() < 1e6 {
            format!("{}", value as i64)
        } else {
            format!("{value:.3}")
        }
    }
}

/// Rejects absolute paths and `..` so a key can never leave the store root.
fn validate_path(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    let ok = !path.is_empty() && p.components().all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(p)
    } else {
        Err(TimbreError::InvalidJob(format!("invalid blob path {path:?}")))
    }
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// Process-local store; URIs look like `mem://<path>`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub const SCHEME: &'static str = "mem://";

    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Stored paths under `prefix`, sorted.
    pub fn paths_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.objects
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn uri_for(path: &str) -> String {
        format!("{}{path}", Self::SCHEME)
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String> {
        validate_path(path)?;
        self.objects.write().insert(path.to_string(), bytes);
        Ok(Self::uri_for(path))
    }

    fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let Some(path) = uri.strip_prefix(Self::SCHEME) else {
            return Err(TimbreError::fetch(uri, "not a mem:// uri"));
        };
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| TimbreError::fetch(uri, "no such object"))
    }
}

// ── Filesystem store ─────────────────────────────────────────────────────────

/// Stores objects as files under `root`.
///
/// URIs are `{public_base_url}/{path}` when a public base URL is configured,
/// `file://{absolute path}` otherwise. `get` reads its own URIs, `file://`
/// URIs and bare paths from disk as long as they resolve inside `root`;
/// `http(s)` URIs go over the network when the `http` feature is enabled.
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: Option<String>,
    fetch_timeout: std::time::Duration,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;

        Ok(Self {
            root,
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
            fetch_timeout: std::time::Duration::from_secs(120),
        })
    }

    pub fn with_fetch_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn uri_for(&self, path: &str, full: &Path) -> String {
        match &self.public_base_url {
            Some(base) => format!("{base}/{path}"),
            None => format!("file://{}", full.display()),
        }
    }

    /// Local file behind `uri`, when the URI points at this machine.
    fn local_path(&self, uri: &str) -> Option<Result<PathBuf>> {
        if let Some(base) = &self.public_base_url {
            if let Some(rest) = uri.strip_prefix(base.as_str()) {
                let rest = rest.trim_start_matches('/');
                return Some(validate_path(rest).map(|p| self.root.join(p)));
            }
        }
        if let Some(rest) = uri.strip_prefix("file://") {
            return Some(self.under_root(rest));
        }
        if !uri.contains("://") {
            return Some(self.under_root(uri));
        }
        None
    }

    /// Resolve a local path, absolute or root-relative, that must stay
    /// inside `root`.
    fn under_root(&self, raw: &str) -> Result<PathBuf> {
        let path = Path::new(raw);
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.root).map_err(|_| {
                TimbreError::InvalidJob(format!("blob path {raw:?} is outside the store root"))
            })?
        } else {
            path
        };
        let rel = rel.to_string_lossy();
        validate_path(&rel).map(|p| self.root.join(p))
    }

    #[cfg(feature = "http")]
    fn fetch_remote(&self, uri: &str) -> Result<Vec<u8>> {
        // Built per call: blocking clients must live on the worker thread.
        let client = reqwest::blocking::Client::builder()
            .timeout(self.fetch_timeout)
            .build()
            .map_err(|e| TimbreError::fetch(uri, e))?;
        let response = client
            .get(uri)
            .send()
            .map_err(|e| TimbreError::fetch(uri, e))?;
        if !response.status().is_success() {
            return Err(TimbreError::fetch(uri, format!("status {}", response.status())));
        }
        let bytes = response.bytes().map_err(|e| TimbreError::fetch(uri, e))?;
        Ok(bytes.to_vec())
    }

    #[cfg(not(feature = "http"))]
    fn fetch_remote(&self, uri: &str) -> Result<Vec<u8>> {
        Err(TimbreError::fetch(uri, "remote fetch requires the `http` feature"))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String> {
        let rel = validate_path(path)?;
        let full = self.root.join(rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, &bytes)?;
        debug!(path, bytes = bytes.len(), "blob stored");
        Ok(self.uri_for(path, &full))
    }

    fn get(&self, uri: &str) -> Result<Vec<u8>> {
        match self.local_path(uri) {
            Some(path) => {
                let path = path?;
                std::fs::read(&path).map_err(|e| TimbreError::fetch(uri, e))
            }
            None if uri.starts_with("http://") || uri.starts_with("https://") => {
                self.fetch_remote(uri)
            }
            None => Err(TimbreError::fetch(uri, "unsupported uri scheme")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        let uri = store.put("a/b/c.wav", vec![1, 2, 3]).unwrap();
        assert_eq!(uri, "mem://a/b/c.wav");
        assert_eq!(store.get(&uri).unwrap(), vec![1, 2, 3]);
        assert_eq!(store.paths_with_prefix("a/"), vec!["a/b/c.wav".to_string()]);
    }

    #[test]
    fn memory_store_missing_object_is_fetch_failure() {
        let store = MemoryBlobStore::new();
        assert!(matches!(
            store.get("mem://nope"),
            Err(TimbreError::UpstreamFetch { .. })
        ));
        assert!(matches!(
            store.get("https://example.invalid/x"),
            Err(TimbreError::UpstreamFetch { .. })
        ));
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let store = MemoryBlobStore::new();
        assert!(store.put("../etc/passwd", vec![]).is_err());
        assert!(store.put("/abs", vec![]).is_err());
        assert!(store.put("", vec![]).is_err());
    }

    #[test]
    fn fs_store_with_public_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), Some("https://cdn.example.com/".into())).unwrap();
        let uri = store.put("remix/j1/m1/isolated-vocal.wav", b"RIFF".to_vec()).unwrap();
        assert_eq!(uri, "https://cdn.example.com/remix/j1/m1/isolated-vocal.wav");
        // own public URIs resolve locally
        assert_eq!(store.get(&uri).unwrap(), b"RIFF".to_vec());
        assert!(dir.path().join("remix/j1/m1/isolated-vocal.wav").exists());
    }

    #[test]
    fn fs_store_file_uris_and_bare_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), None).unwrap();
        let uri = store.put("x/y.bin", vec![9]).unwrap();
        assert!(uri.starts_with("file://"));
        assert_eq!(store.get(&uri).unwrap(), vec![9]);
        let bare = store.root().join("x/y.bin");
        assert_eq!(store.get(bare.to_str().unwrap()).unwrap(), vec![9]);
        assert_eq!(store.get("x/y.bin").unwrap(), vec![9]);
        assert!(matches!(
            store.get("ftp://host/file"),
            Err(TimbreError::UpstreamFetch { .. })
        ));
    }

    #[test]
    fn fs_store_refuses_paths_outside_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("blobs"), None).unwrap();
        std::fs::write(dir.path().join("secret.wav"), b"RIFF").unwrap();
        let outside = dir.path().canonicalize().unwrap().join("secret.wav");

        for uri in [
            "/etc/passwd".to_string(),
            "file:///etc/passwd".to_string(),
            format!("file://{}", outside.display()),
            outside.display().to_string(),
            "../secret.wav".to_string(),
            format!("file://{}/../secret.wav", store.root().display()),
        ] {
            assert!(
                matches!(store.get(&uri), Err(TimbreError::InvalidJob(_))),
                "{uri} was readable"
            );
        }
    }

    #[test]
    fn pitch_keys() {
        assert_eq!(paths::pitch_key(-12.0), "-12");
        assert_eq!(paths::pitch_key(0.0), "0");
        assert_eq!(paths::pitch_key(-1.25), "-1.250");
        assert_eq!(
            paths::conversion("job-1", "m", 3, "-2"),
            "conversions/job-1/m/seg0003/pitch-2.wav"
        );
    }
}
