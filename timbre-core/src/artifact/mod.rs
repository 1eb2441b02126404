//! Model artifact resolution.
//!
//! A voice model needs two files: trained weights and a retrieval index.
//! Model records store them either as one archive or as a flat list of file
//! URIs. [`ArtifactLayout`] classifies the source list once; the
//! [`ArtifactResolver`] turns a layout into a canonical [`ModelArtifact`].
//!
//! ## Archived layout
//!
//! 1. Fetch the archive through the blob store and check the zip signature.
//! 2. Unpack into a private temp dir owned by the returned artifact. Entries
//!    whose paths would land outside that dir are rejected.
//! 3. If the unpacked root holds a single directory, descend into it.
//! 4. Walk the tree for exactly one file per required suffix.
//!
//! The temp dir is removed when the last clone of the artifact is dropped,
//! whatever way the job ends.

use std::{
    io::{Cursor, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::{
    error::{Result, TimbreError},
    store::BlobStore,
};

const ZIP_LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE: &[u8] = b"PK\x05\x06";

/// Archive-exporter metadata directories skipped when descending.
const IGNORED_TOP_LEVEL: &[&str] = &["__MACOSX"];

/// Filename suffixes of the two required files.
#[derive(Debug, Clone)]
pub struct ArtifactSuffixes {
    pub weights: String,
    pub index: String,
}

impl Default for ArtifactSuffixes {
    fn default() -> Self {
        Self {
            weights: ".pth".into(),
            index: ".index".into(),
        }
    }
}

/// Reference to one model file, handed to the inference backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    /// Unpacked into this job's temp dir.
    Local(PathBuf),
    /// Used directly by URI.
    Remote(String),
}

impl ArtifactRef {
    pub fn file_name(&self) -> String {
        match self {
            ArtifactRef::Local(p) => p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ArtifactRef::Remote(u) => strip_query(u)
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactRef::Local(p) => write!(f, "{}", p.display()),
            ArtifactRef::Remote(u) => f.write_str(u),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLayout {
    Archived(String),
    Flat { weights_uri: String, index_uri: String },
}

impl ArtifactLayout {
    /// Classify a model's source URIs.
    ///
    /// - one entry: an archive (a lone weights or index file is incomplete);
    /// - several entries with a weights and an index file: flat (the last
    ///   match of each suffix wins);
    /// - several entries without that pair but with archives: the archive at
    ///   `archive_index`, or the last archive.
    pub fn from_source_uris(
        model_id: &str,
        uris: &[String],
        suffixes: &ArtifactSuffixes,
        archive_index: Option<usize>,
    ) -> Result<Self> {
        match uris {
            [] => Err(TimbreError::incomplete_artifact(model_id, "model has no source files")),
            [single] => {
                if has_suffix(single, &suffixes.weights) || has_suffix(single, &suffixes.index) {
                    Err(TimbreError::incomplete_artifact(
                        model_id,
                        format!("only one model file listed: {single}"),
                    ))
                } else {
                    Ok(ArtifactLayout::Archived(single.clone()))
                }
            }
            many => {
                let weights = many.iter().rev().find(|u| has_suffix(u, &suffixes.weights));
                let index = many.iter().rev().find(|u| has_suffix(u, &suffixes.index));
                if let (Some(w), Some(i)) = (weights, index) {
                    return Ok(ArtifactLayout::Flat {
                        weights_uri: w.clone(),
                        index_uri: i.clone(),
                    });
                }

                let archives: Vec<&String> =
                    many.iter().filter(|u| has_suffix(u, ".zip")).collect();
                let chosen = match archive_index {
                    Some(i) => archives.get(i).copied(),
                    None => archives.last().copied(),
                };
                match chosen {
                    Some(a) => Ok(ArtifactLayout::Archived(a.clone())),
                    None => Err(TimbreError::incomplete_artifact(
                        model_id,
                        format!(
                            "no {}/{} pair and no usable archive among {} files",
                            suffixes.weights,
                            suffixes.index,
                            many.len()
                        ),
                    )),
                }
            }
        }
    }
}

/// The two files needed to run conversion for one voice model.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub model_id: String,
    pub source_uris: Vec<String>,
    pub layout: ArtifactLayout,
    pub weights: ArtifactRef,
    pub index: ArtifactRef,
    pub resolved: bool,
    /// Keeps the unpack dir alive while any clone of this artifact exists.
    workdir: Option<Arc<TempDir>>,
}

impl ModelArtifact {
    /// Directory the archive was unpacked into, if any.
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref().map(TempDir::path)
    }
}

pub struct ArtifactResolver {
    blobs: Arc<dyn BlobStore>,
    suffixes: ArtifactSuffixes,
    scratch_root: Option<PathBuf>,
}

impl ArtifactResolver {
    pub fn new(blobs: Arc<dyn BlobStore>, suffixes: ArtifactSuffixes) -> Self {
        Self {
            blobs,
            suffixes,
            scratch_root: None,
        }
    }

    /// Unpack archives under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn suffixes(&self) -> &ArtifactSuffixes {
        &self.suffixes
    }

    pub fn resolve(
        &self,
        model_id: &str,
        source_uris: &[String],
        archive_index: Option<usize>,
    ) -> Result<ModelArtifact> {
        let layout =
            ArtifactLayout::from_source_uris(model_id, source_uris, &self.suffixes, archive_index)?;
        self.resolve_layout(model_id, source_uris, layout)
    }

    pub fn resolve_layout(
        &self,
        model_id: &str,
        source_uris: &[String],
        layout: ArtifactLayout,
    ) -> Result<ModelArtifact> {
        let (weights, index, workdir) = match &layout {
            ArtifactLayout::Flat {
                weights_uri,
                index_uri,
            } => (
                ArtifactRef::Remote(weights_uri.clone()),
                ArtifactRef::Remote(index_uri.clone()),
                None,
            ),
            ArtifactLayout::Archived(uri) => {
                let bytes = self.blobs.get(uri)?;
                let dir = self.unpack(model_id, uri, &bytes)?;
                let (w, i) = self.scan(model_id, dir.path())?;
                (ArtifactRef::Local(w), ArtifactRef::Local(i), Some(Arc::new(dir)))
            }
        };

        info!(model_id, weights = %weights, index = %index, "model artifact resolved");
        Ok(ModelArtifact {
            model_id: model_id.to_string(),
            source_uris: source_uris.to_vec(),
            layout,
            weights,
            index,
            resolved: true,
            workdir,
        })
    }

    fn unpack(&self, model_id: &str, uri: &str, bytes: &[u8]) -> Result<TempDir> {
        if !(bytes.starts_with(ZIP_LOCAL_HEADER) || bytes.starts_with(ZIP_EMPTY_ARCHIVE)) {
            return Err(TimbreError::incomplete_artifact(
                model_id,
                format!("{uri} is not a zip archive"),
            ));
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("timbre-artifact-");
        let dir = match &self.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        let zip_err = |e: zip::result::ZipError| {
            TimbreError::incomplete_artifact(model_id, format!("archive {uri}: {e}"))
        };
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(zip_err)?;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(zip_err)?;
            let Some(rel) = entry.enclosed_name() else {
                return Err(TimbreError::incomplete_artifact(
                    model_id,
                    format!("archive entry {:?} escapes the extraction dir", entry.name()),
                ));
            };
            let target = dir.path().join(rel);
            if entry.is_dir() {
                std::fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            std::fs::write(&target, buf)?;
        }

        debug!(model_id, entries = archive.len(), dir = %dir.path().display(), "archive unpacked");
        Ok(dir)
    }

    /// Locate exactly one weights and one index file under `root`.
    fn scan(&self, model_id: &str, root: &Path) -> Result<(PathBuf, PathBuf)> {
        let root = descend_single_dir(root)?;
        let mut weights = Vec::new();
        let mut index = Vec::new();
        for entry in WalkDir::new(&root) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if has_suffix(&name, &self.suffixes.weights) {
                weights.push(entry.path().to_path_buf());
            } else if has_suffix(&name, &self.suffixes.index) {
                index.push(entry.path().to_path_buf());
            }
        }

        let weights = exactly_one(model_id, weights, &self.suffixes.weights)?;
        let index = exactly_one(model_id, index, &self.suffixes.index)?;
        Ok((weights, index))
    }
}

fn exactly_one(model_id: &str, mut found: Vec<PathBuf>, suffix: &str) -> Result<PathBuf> {
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(TimbreError::incomplete_artifact(
            model_id,
            format!("no {suffix} file in archive"),
        )),
        n => Err(TimbreError::incomplete_artifact(
            model_id,
            format!("{n} {suffix} files in archive, expected one"),
        )),
    }
}

/// `root`, or its only subdirectory when that is all it contains.
fn descend_single_dir(root: &Path) -> Result<PathBuf> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        if IGNORED_TOP_LEVEL.iter().any(|i| name == *i) {
            continue;
        }
        entries.push(entry);
    }
    match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => Ok(only.path()),
        _ => Ok(root.to_path_buf()),
    }
}

fn strip_query(uri: &str) -> &str {
    let end = uri.find(['?', '#']).unwrap_or(uri.len());
    &uri[..end]
}

fn has_suffix(name: &str, suffix: &str) -> bool {
    strip_query(name)
        .to_ascii_lowercase()
        .ends_with(&suffix.to_ascii_lowercase())
}
