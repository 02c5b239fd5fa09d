//! Append-only archival.
//!
//! Each processed package is filed under
//!
//! ```text
//! {base}/{cycle}/{Processed|Failed}/{cluster}/{instance}/
//!     {package}            original archive
//!     compiled_units.txt   human-readable report
//!     verdict.json         machine-readable verdict and audit mapping
//! ```
//!
//! # Invariants
//!
//! - [INV-ARCH-001] Nothing is ever overwritten. A taken name becomes
//!   `{stem}_{N}{ext}` with the smallest free `N >= 1`.
//! - [INV-ARCH-002] Every file is staged in the destination directory and
//!   published with a no-clobber rename, so a failed write never leaves a
//!   truncated file under a final name.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

use crate::audit::AuditMapping;
use crate::cycle::DeploymentCycle;
use crate::unwrap::ExtractedPackage;
use crate::validate::ValidationVerdict;

/// Report filename.
pub const REPORT_FILE: &str = "compiled_units.txt";

/// Verdict document filename.
pub const VERDICT_FILE: &str = "verdict.json";

/// Upper bound on suffixes tried for one name.
const MAX_SUFFIX: u32 = 100_000;

/// Errors raised while archiving.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArchiveError {
    /// An I/O error occurred.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Human-readable description of the operation.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The verdict document could not be serialized.
    #[error("cannot serialize verdict document: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ArchiveError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Where an archived package ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveRecord {
    /// `{base}/{cycle}/{bucket}/{cluster}/{instance}`.
    pub destination: PathBuf,
    /// Stored copy of the original package.
    pub package: PathBuf,
    /// Human-readable report.
    pub report: PathBuf,
    /// Machine-readable verdict document.
    pub verdict_document: PathBuf,
}

/// `name` with `_{n}` inserted before the extension.
pub(crate) fn suffixed_name(name: &str, n: u32) -> String {
    let path = Path::new(name);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => {
            format!("{}_{n}.{}", stem.to_string_lossy(), ext.to_string_lossy())
        },
        _ => format!("{name}_{n}"),
    }
}

/// Publish `staged` as `dir/name`, or the first free suffixed name.
fn publish_no_clobber(
    mut staged: NamedTempFile,
    dir: &Path,
    name: &str,
) -> Result<PathBuf, ArchiveError> {
    for n in 0..MAX_SUFFIX {
        let candidate = if n == 0 {
            dir.join(name)
        } else {
            dir.join(suffixed_name(name, n))
        };
        match staged.persist_noclobber(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => staged = e.file,
            Err(e) => {
                return Err(ArchiveError::io(
                    format!("publishing {}", candidate.display()),
                    e.error,
                ));
            },
        }
    }
    Err(ArchiveError::io(
        format!("finding a free name for {name}"),
        io::Error::new(io::ErrorKind::AlreadyExists, "suffix space exhausted"),
    ))
}

fn write_no_clobber(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, ArchiveError> {
    let mut staged = NamedTempFile::new_in(dir)
        .map_err(|e| ArchiveError::io(format!("staging {name}"), e))?;
    staged
        .write_all(bytes)
        .and_then(|()| staged.as_file().sync_all())
        .map_err(|e| ArchiveError::io(format!("writing {name}"), e))?;
    publish_no_clobber(staged, dir, name)
}

fn copy_no_clobber(dir: &Path, source: &Path) -> Result<PathBuf, ArchiveError> {
    let name = source
        .file_name()
        .map_or_else(|| "package.zip".to_string(), |n| n.to_string_lossy().into_owned());
    let mut input = std::fs::File::open(source)
        .map_err(|e| ArchiveError::io(format!("opening {}", source.display()), e))?;
    let mut staged = NamedTempFile::new_in(dir)
        .map_err(|e| ArchiveError::io(format!("staging {name}"), e))?;
    io::copy(&mut input, &mut staged)
        .and_then(|_| staged.as_file().sync_all())
        .map_err(|e| ArchiveError::io(format!("copying {}", source.display()), e))?;
    publish_no_clobber(staged, dir, &name)
}

#[derive(Serialize)]
struct VerdictDocument<'a> {
    cycle: &'a str,
    cluster: &'a str,
    instance: &'a str,
    package: String,
    source: &'a Path,
    archived_at: DateTime<Utc>,
    verdict: &'a ValidationVerdict,
    tickets: &'a AuditMapping,
}

/// Files packages into the cycle hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Archiver;

impl Archiver {
    /// Create an archiver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Destination directory for a package.
    #[must_use]
    pub fn destination(
        cycle: &DeploymentCycle,
        verdict: &ValidationVerdict,
        cluster: &str,
        instance: &str,
    ) -> PathBuf {
        cycle
            .path()
            .join(verdict.status.archive_bucket())
            .join(cluster)
            .join(instance)
    }

    /// Archive an extracted package.
    pub fn archive(
        &self,
        package: &ExtractedPackage,
        verdict: &ValidationVerdict,
        mapping: &AuditMapping,
        cycle: &DeploymentCycle,
    ) -> Result<ArchiveRecord, ArchiveError> {
        self.archive_source(
            package.source(),
            package.cluster(),
            package.instance(),
            verdict,
            mapping,
            cycle,
        )
    }

    /// Archive `source` for `cluster`/`instance`.
    pub fn archive_source(
        &self,
        source: &Path,
        cluster: &str,
        instance: &str,
        verdict: &ValidationVerdict,
        mapping: &AuditMapping,
        cycle: &DeploymentCycle,
    ) -> Result<ArchiveRecord, ArchiveError> {
        let destination = Self::destination(cycle, verdict, cluster, instance);
        std::fs::create_dir_all(&destination)
            .map_err(|e| ArchiveError::io(format!("creating {}", destination.display()), e))?;

        let package = copy_no_clobber(&destination, source)?;
        let stored_name = package
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let report_text = render_report(cycle, cluster, instance, &stored_name, verdict, mapping);
        let report = write_no_clobber(&destination, REPORT_FILE, report_text.as_bytes())?;

        let document = VerdictDocument {
            cycle: cycle.name(),
            cluster,
            instance,
            package: stored_name,
            source,
            archived_at: Utc::now(),
            verdict,
            tickets: mapping,
        };
        let json = serde_json::to_vec_pretty(&document)?;
        let verdict_document = write_no_clobber(&destination, VERDICT_FILE, &json)?;

        info!(
            cycle = cycle.name(),
            cluster,
            instance,
            status = %verdict.status,
            package = %package.display(),
            "package archived"
        );

        Ok(ArchiveRecord {
            destination,
            package,
            report,
            verdict_document,
        })
    }
}

/// Render the human-readable report.
#[must_use]
pub fn render_report(
    cycle: &DeploymentCycle,
    cluster: &str,
    instance: &str,
    package: &str,
    verdict: &ValidationVerdict,
    mapping: &AuditMapping,
) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(out, "Deployment Validation Report");
    let _ = writeln!(out, "============================");
    let _ = writeln!(out, "Cycle:     {}", cycle.name());
    let _ = writeln!(out, "Cluster:   {cluster}");
    let _ = writeln!(out, "Instance:  {instance}");
    let _ = writeln!(out, "Package:   {package}");
    let _ = writeln!(out, "Status:    {}", verdict.status);
    let _ = writeln!(out, "Summary:   {}", verdict.summary);

    let _ = writeln!(out, "\nChecks");
    for check in &verdict.checks {
        let mark = if check.passed { "PASS" } else { "FAIL" };
        let _ = write!(out, "  [{mark}] {}: {}", check.kind.as_str(), check.detail);
        if let Some(problem) = &check.problem {
            let _ = write!(out, " ({problem})");
        }
        let _ = writeln!(out);
    }

    if !verdict.errors.is_empty() {
        let _ = writeln!(out, "\nErrors");
        for error in &verdict.errors {
            let unit = error.unit.as_deref().unwrap_or("-");
            let _ = writeln!(out, "  {} [{unit}] {}: {}", error.code, error.file, error.message);
        }
    }
    if !verdict.invalid_objects.is_empty() {
        let _ = writeln!(out, "\nInvalid Objects");
        for object in &verdict.invalid_objects {
            let _ = writeln!(out, "  {} ({})", object.name, object.object_type);
        }
    }
    if !verdict.dropped_units.is_empty() {
        let _ = writeln!(out, "\nDropped Units");
        for unit in &verdict.dropped_units {
            let _ = writeln!(out, "  {unit}");
        }
    }
    if !verdict.orphaned_units.is_empty() {
        let _ = writeln!(out, "\nOrphaned Units");
        for unit in &verdict.orphaned_units {
            let _ = writeln!(out, "  {unit}");
        }
    }

    let _ = writeln!(out, "\nCompiled Units by Ticket");
    if mapping.is_empty() {
        let _ = writeln!(out, "  (no tickets found)");
    }
    for entry in mapping.iter() {
        if entry.units.is_empty() {
            let _ = writeln!(out, "  {}: (no units)", entry.ticket);
        } else {
            let _ = writeln!(out, "  {}: {}", entry.ticket, entry.units.join(", "));
        }
    }
    out
}
