//! Processed-file ledger.
//!
//! The [`FingerprintStore`] remembers, per filename, the (size, mtime)
//! [`Fingerprint`] of the revision that last made it through the whole
//! pipeline. A file is eligible for processing when its name was never
//! recorded or its current fingerprint differs from the recorded one.
//!
//! # Invariants
//!
//! - [INV-FP-001] Entries are never removed; a new revision replaces the
//!   fingerprint of the same name.
//! - [INV-FP-002] `record` is only called after downstream success, so a
//!   crash mid-pipeline leads to a retry (at-least-once).
//! - [INV-FP-003] When backed by a state file, every `record` rewrites the
//!   file atomically (temp file + rename); a reader never sees a partial
//!   document.

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

/// Current state file format version.
const STATE_VERSION: u32 = 1;

/// Revision identity of a file: byte size plus modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// File size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

impl Fingerprint {
    /// Create a fingerprint.
    #[must_use]
    pub const fn new(size: u64, modified: DateTime<Utc>) -> Self {
        Self { size, modified }
    }

    /// Build a fingerprint from file metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform does not report modification times.
    pub fn from_metadata(metadata: &Metadata) -> std::io::Result<Self> {
        Ok(Self {
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
        })
    }
}

/// What kind of input a watched file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// A zip archive carrying deployment logs.
    Archive,
    /// An email container carrying zip attachments.
    Container,
}

impl FileKind {
    /// Classify `name` by extension (case-insensitive).
    ///
    /// Returns `None` for files the pipeline does not handle.
    #[must_use]
    pub fn classify(name: &str, container_extension: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("zip") {
            Some(Self::Archive)
        } else if ext.eq_ignore_ascii_case(container_extension) {
            Some(Self::Container)
        } else {
            None
        }
    }
}

/// A file observed in the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFile {
    /// Filename (identity in the store).
    pub name: String,
    /// Absolute path.
    pub path: PathBuf,
    /// Observed revision.
    pub fingerprint: Fingerprint,
    /// Archive or container.
    pub kind: FileKind,
}

/// Errors from the persistent store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The state file could not be read or written.
    #[error("state file I/O error at {path}: {source}")]
    Io {
        /// State file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The state file exists but is not a valid document.
    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        /// State file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The state file was written by an incompatible version.
    #[error("state file {path} has unsupported version {version}")]
    UnsupportedVersion {
        /// State file path.
        path: PathBuf,
        /// Version found in the file.
        version: u32,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    files: BTreeMap<String, Fingerprint>,
}

/// Ledger of processed files.
#[derive(Debug, Default)]
pub struct FingerprintStore {
    entries: BTreeMap<String, Fingerprint>,
    state_file: Option<PathBuf>,
}

impl FingerprintStore {
    /// Create an in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a store backed by a JSON state file.
    ///
    /// A missing file yields an empty store; the file is created on the
    /// first [`record`](Self::record).
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => {
                let doc: StateDocument =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                if doc.version != STATE_VERSION {
                    return Err(StoreError::UnsupportedVersion {
                        path,
                        version: doc.version,
                    });
                }
                doc.files
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        info!(path = %path.display(), entries = entries.len(), "fingerprint store opened");
        Ok(Self {
            entries,
            state_file: Some(path),
        })
    }

    /// Whether `name` was ever recorded.
    #[must_use]
    pub fn seen(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Whether `name` is recorded with exactly this size and mtime.
    #[must_use]
    pub fn fingerprint_matches(&self, name: &str, size: u64, modified: DateTime<Utc>) -> bool {
        self.entries.get(name) == Some(&Fingerprint::new(size, modified))
    }

    /// Whether `file` should be handed to the pipeline.
    #[must_use]
    pub fn is_eligible(&self, file: &IncomingFile) -> bool {
        !self.fingerprint_matches(&file.name, file.fingerprint.size, file.fingerprint.modified)
    }

    /// The recorded fingerprint for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Fingerprint> {
        self.entries.get(name)
    }

    /// Number of recorded names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record `name` as processed at this revision.
    ///
    /// The in-memory entry is updated even when persisting fails; the
    /// error tells the caller the state file is stale.
    pub fn record(
        &mut self,
        name: &str,
        size: u64,
        modified: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.entries
            .insert(name.to_string(), Fingerprint::new(size, modified));
        debug!(name, size, %modified, "fingerprint recorded");
        self.persist()
    }

    fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent).map_err(io_err)?;

        let doc = StateDocument {
            version: STATE_VERSION,
            files: self.entries.clone(),
        };
        let json = serde_json::to_vec_pretty(&doc).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}
