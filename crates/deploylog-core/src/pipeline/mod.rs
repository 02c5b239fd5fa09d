//! One archive end-to-end.
//!
//! [`Pipeline::process_archive`] runs
//!
//! ```text
//! unwrap -> validate -> extract -> archive -> notify
//! ```
//!
//! for a single zip archive. Failures carry the [`Stage`] they happened in.
//! Validation never fails (problems are part of the verdict), extraction
//! never fails, and notification failures are logged without failing the
//! run. The extraction sandbox is released on every exit path.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Weekday};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::archive::{ArchiveError, ArchiveRecord, Archiver};
use crate::audit::{AuditExtractor, AuditMapping};
use crate::config::MonitorConfig;
use crate::cycle::DeploymentCycle;
use crate::notify::{Notifier, SpoolTransport};
use crate::unwrap::{ExtractLimits, ExtractedPackage, UnwrapError, Unwrapper};
use crate::validate::{ValidationVerdict, Validator};

/// Pipeline stage that failed.
///
/// Only stages that can fail a file appear here. Validation, audit
/// extraction and notification always complete: a failing check becomes a
/// FAIL verdict, a missing audit line an empty mapping, and an undelivered
/// notification a logged warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Container or archive unwrapping.
    Unwrap,
    /// Archival.
    Archive,
}

impl Stage {
    /// Stable identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unwrap => "unwrap",
            Self::Archive => "archive",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The underlying cause of a [`PipelineError`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineErrorKind {
    /// Unwrapping failed.
    #[error(transparent)]
    Unwrap(#[from] UnwrapError),

    /// Archival failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl PipelineErrorKind {
    /// Short machine-readable kind.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unwrap(e) => e.kind(),
            Self::Archive(_) => "archive_io",
        }
    }
}

/// A failed run, tagged with the input file and stage.
#[derive(Debug, Error)]
#[error("{stage} stage failed for {}: {kind}", file.display())]
pub struct PipelineError {
    /// Input file.
    pub file: PathBuf,
    /// Stage that failed.
    pub stage: Stage,
    /// Cause.
    #[source]
    pub kind: PipelineErrorKind,
}

impl PipelineError {
    fn new(file: &Path, stage: Stage, kind: impl Into<PipelineErrorKind>) -> Self {
        Self {
            file: file.to_path_buf(),
            stage,
            kind: kind.into(),
        }
    }

    /// Whether the input must be recorded as permanently rejected.
    ///
    /// Only path traversal qualifies; every other failure is retried on
    /// the next poll.
    #[must_use]
    pub fn is_permanent_rejection(&self) -> bool {
        matches!(&self.kind, PipelineErrorKind::Unwrap(e) if e.is_path_traversal())
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Input archive.
    pub archive: PathBuf,
    /// Instance identifier.
    pub instance: String,
    /// Cluster identifier.
    pub cluster: String,
    /// Cycle identifier.
    pub cycle: String,
    /// Validation verdict.
    pub verdict: ValidationVerdict,
    /// Audit mapping.
    pub mapping: AuditMapping,
    /// Where everything was stored.
    pub record: ArchiveRecord,
    /// Notification outcome; `None` when notifications are disabled.
    pub notified: Option<bool>,
}

/// Outcome of [`Pipeline::check_archive`].
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Instance identifier.
    pub instance: String,
    /// Cluster identifier.
    pub cluster: String,
    /// Validation verdict.
    pub verdict: ValidationVerdict,
    /// Audit mapping.
    pub tickets: AuditMapping,
}

/// The ingestion pipeline.
#[derive(Debug)]
pub struct Pipeline {
    unwrapper: Unwrapper,
    validator: Validator,
    extractor: AuditExtractor,
    archiver: Archiver,
    notifier: Option<Notifier>,
    base_archive_path: PathBuf,
    reference_weekday: Weekday,
}

impl Pipeline {
    /// Assemble a pipeline without notifications.
    #[must_use]
    pub fn new(
        unwrapper: Unwrapper,
        validator: Validator,
        base_archive_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            unwrapper,
            validator,
            extractor: AuditExtractor::new(),
            archiver: Archiver::new(),
            notifier: None,
            base_archive_path: base_archive_path.into(),
            reference_weekday: crate::cycle::DEFAULT_REFERENCE_WEEKDAY,
        }
    }

    /// Build the pipeline described by `config`.
    #[must_use]
    pub fn from_config(config: &MonitorConfig) -> Self {
        let unwrapper = Unwrapper::new(&config.clusters)
            .with_limits(ExtractLimits {
                max_entries: config.monitor.max_archive_entries,
                max_bytes: config.monitor.max_extracted_bytes,
            })
            .with_scratch_dir(config.monitor.scratch_dir.clone());
        let validator = Validator::new(&config.validation.ignorable_errors);

        let notification = &config.notification;
        let notifier = match (&notification.outbox_dir, notification.enabled) {
            (Some(outbox), true) => Some(Notifier::new(
                notification.notifier_settings(),
                Box::new(SpoolTransport::new(outbox.clone())),
            )),
            _ => None,
        };

        Self {
            notifier,
            reference_weekday: config.monitor.anchor_weekday,
            ..Self::new(unwrapper, validator, config.monitor.base_archive_path.clone())
        }
    }

    /// Attach a notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Anchor cycles on `weekday` instead of Friday.
    #[must_use]
    pub const fn with_reference_weekday(mut self, weekday: Weekday) -> Self {
        self.reference_weekday = weekday;
        self
    }

    /// Cycle for a processing date.
    #[must_use]
    pub fn cycle_for(&self, date: NaiveDate) -> DeploymentCycle {
        DeploymentCycle::anchored(&self.base_archive_path, date, self.reference_weekday)
    }

    /// Extract the zip attachments of a container into `dest_dir`.
    pub fn unwrap_container(
        &self,
        container: &Path,
        dest_dir: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        self.unwrapper
            .unwrap_container(container, dest_dir)
            .map_err(|e| PipelineError::new(container, Stage::Unwrap, e))
    }

    fn unwrap_archive(&self, archive: &Path) -> Result<ExtractedPackage, PipelineError> {
        self.unwrapper
            .unwrap_archive(archive)
            .map_err(|e| PipelineError::new(archive, Stage::Unwrap, e))
    }

    /// Unwrap, validate and extract without archiving or notifying.
    pub fn check_archive(&self, archive: &Path) -> Result<CheckResult, PipelineError> {
        let package = self.unwrap_archive(archive)?;
        let verdict = self.validator.validate_package(&package);
        let tickets = self.extractor.extract(package.primary_log());
        let result = CheckResult {
            instance: package.instance().to_string(),
            cluster: package.cluster().to_string(),
            verdict,
            tickets,
        };
        release(package);
        Ok(result)
    }

    /// Run the whole pipeline for one zip archive processed on `date`.
    pub fn process_archive(
        &self,
        archive: &Path,
        date: NaiveDate,
    ) -> Result<RunReport, PipelineError> {
        let package = self.unwrap_archive(archive)?;
        let verdict = self.validator.validate_package(&package);
        let mapping = self.extractor.extract(package.primary_log());
        let cycle = self.cycle_for(date);

        let record = self
            .archiver
            .archive(&package, &verdict, &mapping, &cycle)
            .map_err(|e| PipelineError::new(archive, Stage::Archive, e))?;

        let notified = self.notifier.as_ref().map(|notifier| {
            let message = format!(
                "{}\n\nArchived to: {}",
                verdict.summary,
                record.destination.display()
            );
            notifier.notify(
                verdict.status.as_str(),
                package.cluster(),
                package.instance(),
                &message,
            )
        });

        info!(
            archive = %archive.display(),
            instance = package.instance(),
            cluster = package.cluster(),
            cycle = cycle.name(),
            status = %verdict.status,
            "pipeline run finished"
        );

        let report = RunReport {
            archive: archive.to_path_buf(),
            instance: package.instance().to_string(),
            cluster: package.cluster().to_string(),
            cycle: cycle.name().to_string(),
            verdict,
            mapping,
            record,
            notified,
        };
        release(package);
        Ok(report)
    }
}

fn release(package: ExtractedPackage) {
    let sandbox = package.sandbox().to_path_buf();
    if let Err(e) = package.close() {
        warn!(sandbox = %sandbox.display(), error = %e, "failed to remove extraction sandbox");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_traversal_is_permanent() {
        let traversal = PipelineError::new(
            Path::new("evil.zip"),
            Stage::Unwrap,
            UnwrapError::PathTraversal {
                entry: "../../evil.sh".to_string(),
                reason: "parent directory above root",
            },
        );
        assert!(traversal.is_permanent_rejection());
        assert_eq!(traversal.kind.name(), "path_traversal");

        let missing = PipelineError::new(
            Path::new("pkg.zip"),
            Stage::Unwrap,
            UnwrapError::MissingLog {
                kind: "primary",
                suffix: crate::unwrap::PRIMARY_LOG_SUFFIX,
                archive: PathBuf::from("pkg.zip"),
            },
        );
        assert!(!missing.is_permanent_rejection());
        assert!(missing.to_string().starts_with("unwrap stage failed for pkg.zip"));
    }

    #[test]
    fn test_archive_failure_is_tagged_and_retryable() {
        let err = PipelineError::new(
            Path::new("pkg.zip"),
            Stage::Archive,
            ArchiveError::Io {
                context: "creating destination".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            },
        );

        assert_eq!(err.stage, Stage::Archive);
        assert_eq!(err.kind.name(), "archive_io");
        assert!(!err.is_permanent_rejection());
        assert!(err.to_string().starts_with("archive stage failed for pkg.zip"));
        assert_eq!(
            serde_json::to_value(Stage::Unwrap).unwrap(),
            serde_json::json!("unwrap")
        );
    }
}
