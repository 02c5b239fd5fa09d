//! Package unwrapping.
//!
//! Two entry points:
//!
//! - [`Unwrapper::unwrap_container`] turns an email container into the zip
//!   archives attached to it.
//! - [`Unwrapper::unwrap_archive`] extracts a zip archive into a private
//!   sandbox and locates the deployment logs inside it, producing an
//!   [`ExtractedPackage`].
//!
//! The returned package owns its sandbox. Dropping it removes the
//! directory; [`ExtractedPackage::close`] does the same and reports removal
//! failures.

mod archive;
mod container;
mod error;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::TempDir;
use tracing::{debug, info, warn};

pub use archive::{ExtractLimits, extract_zip, sanitize_entry_name};
pub use container::unwrap_container;
pub use error::UnwrapError;

#[cfg(test)]
pub(crate) use container::tests::build_msg;

/// Filename suffix of the primary (execution) log.
pub const PRIMARY_LOG_SUFFIX: &str = "_oracle.log_completed.log";

/// Filename suffix of the secondary (invalid objects) log.
pub const SECONDARY_LOG_SUFFIX: &str = "_invalids_completed.log";

/// Substring identifying the optional tertiary (raw errors) log.
pub const TERTIARY_LOG_MARKER: &str = "oracle_error";

/// Maximum directory depth searched for logs.
const MAX_SCAN_DEPTH: usize = 16;

/// A zip archive extracted into its own sandbox.
#[derive(Debug)]
pub struct ExtractedPackage {
    instance: String,
    cluster: String,
    primary_log: PathBuf,
    secondary_log: PathBuf,
    tertiary_log: Option<PathBuf>,
    source: PathBuf,
    sandbox: TempDir,
}

impl ExtractedPackage {
    /// Instance identifier derived from the primary log name.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Cluster the instance belongs to.
    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Primary execution log.
    #[must_use]
    pub fn primary_log(&self) -> &Path {
        &self.primary_log
    }

    /// Secondary invalid-objects log.
    #[must_use]
    pub fn secondary_log(&self) -> &Path {
        &self.secondary_log
    }

    /// Optional tertiary error log.
    #[must_use]
    pub fn tertiary_log(&self) -> Option<&Path> {
        self.tertiary_log.as_deref()
    }

    /// The archive this package was extracted from.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Sandbox directory.
    #[must_use]
    pub fn sandbox(&self) -> &Path {
        self.sandbox.path()
    }

    /// Remove the sandbox, reporting failures.
    pub fn close(self) -> std::io::Result<()> {
        self.sandbox.close()
    }
}

/// Unwraps containers and archives according to the configuration.
#[derive(Debug, Clone)]
pub struct Unwrapper {
    instance_clusters: BTreeMap<String, String>,
    limits: ExtractLimits,
    scratch_dir: Option<PathBuf>,
}

impl Unwrapper {
    /// Create an unwrapper from a cluster → instances map.
    #[must_use]
    pub fn new(clusters: &BTreeMap<String, Vec<String>>) -> Self {
        let instance_clusters = clusters
            .iter()
            .flat_map(|(cluster, instances)| {
                instances
                    .iter()
                    .map(move |instance| (instance.clone(), cluster.clone()))
            })
            .collect();
        Self {
            instance_clusters,
            limits: ExtractLimits::default(),
            scratch_dir: None,
        }
    }

    /// Set extraction bounds.
    #[must_use]
    pub const fn with_limits(mut self, limits: ExtractLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Create sandboxes under `dir` instead of the system temp directory.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.scratch_dir = dir;
        self
    }

    /// Extract the zip attachments of `container` into `dest_dir`.
    pub fn unwrap_container(
        &self,
        container: &Path,
        dest_dir: &Path,
    ) -> Result<Vec<PathBuf>, UnwrapError> {
        container::unwrap_container(container, dest_dir, self.limits.max_bytes)
    }

    /// Extract `archive` into a fresh sandbox and locate its logs.
    pub fn unwrap_archive(&self, archive: &Path) -> Result<ExtractedPackage, UnwrapError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("deploylog-");
        let sandbox = match &self.scratch_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
        .map_err(|e| UnwrapError::io("creating extraction sandbox", e))?;

        let files = extract_zip(archive, sandbox.path(), self.limits)?;
        debug!(archive = %archive.display(), files = files.len(), "archive extracted");

        let logs = discover_logs(sandbox.path())
            .map_err(|e| UnwrapError::io(format!("scanning {}", sandbox.path().display()), e))?;

        let primary_log = pick_latest(archive, "primary", logs.primary)?.ok_or_else(|| {
            UnwrapError::MissingLog {
                kind: "primary",
                suffix: PRIMARY_LOG_SUFFIX,
                archive: archive.to_path_buf(),
            }
        })?;
        let secondary_log = pick_latest(archive, "secondary", logs.secondary)?.ok_or_else(|| {
            UnwrapError::MissingLog {
                kind: "secondary",
                suffix: SECONDARY_LOG_SUFFIX,
                archive: archive.to_path_buf(),
            }
        })?;
        let tertiary_log = pick_latest(archive, "tertiary", logs.tertiary)?;

        let instance = instance_from_primary(&primary_log);
        let cluster = self
            .instance_clusters
            .get(&instance)
            .cloned()
            .ok_or_else(|| UnwrapError::UnknownInstance {
                instance: instance.clone(),
            })?;

        info!(
            archive = %archive.display(),
            %instance,
            %cluster,
            tertiary = tertiary_log.is_some(),
            "package unwrapped"
        );

        Ok(ExtractedPackage {
            instance,
            cluster,
            primary_log,
            secondary_log,
            tertiary_log,
            source: archive.to_path_buf(),
            sandbox,
        })
    }
}

#[derive(Debug, Default)]
struct DiscoveredLogs {
    primary: Vec<PathBuf>,
    secondary: Vec<PathBuf>,
    tertiary: Vec<PathBuf>,
}

fn discover_logs(root: &Path) -> std::io::Result<DiscoveredLogs> {
    let mut logs = DiscoveredLogs::default();
    let mut pending = vec![(root.to_path_buf(), 0usize)];

    while let Some((dir, depth)) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                if depth + 1 < MAX_SCAN_DEPTH {
                    pending.push((path, depth + 1));
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
            if name.ends_with(PRIMARY_LOG_SUFFIX) {
                logs.primary.push(path);
            } else if name.ends_with(SECONDARY_LOG_SUFFIX) {
                logs.secondary.push(path);
            } else if name.contains(TERTIARY_LOG_MARKER) {
                logs.tertiary.push(path);
            }
        }
    }

    Ok(logs)
}

/// Most recently modified candidate; ties go to the greatest path.
fn pick_latest(
    archive: &Path,
    kind: &'static str,
    candidates: Vec<PathBuf>,
) -> Result<Option<PathBuf>, UnwrapError> {
    if candidates.len() > 1 {
        warn!(
            archive = %archive.display(),
            kind,
            candidates = candidates.len(),
            "multiple logs match, using the most recently modified"
        );
    }

    let mut best: Option<(SystemTime, PathBuf)> = None;
    for path in candidates {
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|e| UnwrapError::io(format!("reading {}", path.display()), e))?;
        let better = best
            .as_ref()
            .is_none_or(|(t, p)| (modified, &path) > (*t, p));
        if better {
            best = Some((modified, path));
        }
    }
    Ok(best.map(|(_, path)| path))
}

fn instance_from_primary(primary: &Path) -> String {
    let name = primary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cut = name.len().saturating_sub(PRIMARY_LOG_SUFFIX.len());
    name.get(..cut).unwrap_or_default().to_string()
}
