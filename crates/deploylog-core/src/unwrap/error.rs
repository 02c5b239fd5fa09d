//! Unwrapper error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while unwrapping containers and archives.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UnwrapError {
    /// The email container could not be parsed.
    #[error("cannot parse container {}: {reason}", path.display())]
    ContainerFormat {
        /// Container path.
        path: PathBuf,
        /// Parser diagnostic.
        reason: String,
    },

    /// An archive entry would resolve outside the extraction sandbox.
    #[error("archive entry '{entry}' escapes the extraction directory ({reason})")]
    PathTraversal {
        /// Entry name as stored in the archive.
        entry: String,
        /// Which rule rejected it.
        reason: &'static str,
    },

    /// A required log is absent from the extracted package.
    #[error("no {kind} log matching *{suffix} in {}", archive.display())]
    MissingLog {
        /// `primary` or `secondary`.
        kind: &'static str,
        /// Expected filename suffix.
        suffix: &'static str,
        /// Archive that was searched.
        archive: PathBuf,
    },

    /// The instance named by the primary log is not in any cluster.
    #[error("instance '{instance}' is not assigned to any configured cluster")]
    UnknownInstance {
        /// Instance derived from the primary log name.
        instance: String,
    },

    /// The zip archive is unreadable.
    #[error("corrupt archive {}: {source}", path.display())]
    CorruptArchive {
        /// Archive path.
        path: PathBuf,
        /// Underlying zip error.
        #[source]
        source: zip::result::ZipError,
    },

    /// The archive exceeds the configured entry or size bound.
    #[error("archive {} exceeds extraction limit: {reason}", path.display())]
    ExtractionLimit {
        /// Archive path.
        path: PathBuf,
        /// Which bound was hit.
        reason: String,
    },

    /// An I/O error occurred.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Human-readable description of the operation.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl UnwrapError {
    /// Build an [`UnwrapError::Io`] with context.
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Short machine-readable kind, used in logs and activity lines.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ContainerFormat { .. } => "container_format",
            Self::PathTraversal { .. } => "path_traversal",
            Self::MissingLog { .. } => "missing_log",
            Self::UnknownInstance { .. } => "unknown_instance",
            Self::CorruptArchive { .. } => "corrupt_archive",
            Self::ExtractionLimit { .. } => "extraction_limit",
            Self::Io { .. } => "io",
        }
    }

    /// Whether this error must permanently reject the input file.
    #[must_use]
    pub const fn is_path_traversal(&self) -> bool {
        matches!(self, Self::PathTraversal { .. })
    }
}
