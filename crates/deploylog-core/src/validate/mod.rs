//! Deployment validation.
//!
//! The [`Validator`] runs three independent checks against the logs of an
//! extracted package:
//!
//! 1. **Error scan**: non-ignorable Oracle error codes in the primary log
//!    and, when present, the tertiary error log.
//! 2. **Invalid objects**: object status rows not in a `VALID`/`OK` state in
//!    the secondary log, plus a start/end invalid-count comparison.
//! 3. **Execution integrity**: every `execution start` marker must be
//!    matched by an `execution end` or `execution skipped` marker.
//!
//! All checks always run. The verdict is `FAIL` iff at least one check
//! failed, and it carries the union of everything that was found.
//! Unreadable logs are reported as [`CheckProblem::IoFailure`] on the
//! affected check, never as a pass.

mod checks;
pub mod grammar;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::unwrap::ExtractedPackage;

/// Summary used for a passing verdict.
pub const PASS_SUMMARY: &str = "Deployment validated successfully";

/// Overall verdict status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictStatus {
    /// All checks passed.
    Pass,
    /// At least one check failed.
    Fail,
}

impl VerdictStatus {
    /// `PASS` or `FAIL`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }

    /// Archive bucket for this status.
    #[must_use]
    pub const fn archive_bucket(self) -> &'static str {
        match self {
            Self::Pass => "Processed",
            Self::Fail => "Failed",
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which check produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Error-code scan.
    ErrorScan,
    /// Invalid-object detection.
    InvalidObjects,
    /// Execution-integrity check.
    ExecutionIntegrity,
}

impl CheckKind {
    /// Stable identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ErrorScan => "error_scan",
            Self::InvalidObjects => "invalid_objects",
            Self::ExecutionIntegrity => "execution_integrity",
        }
    }

    /// Summary phrase used when the check fails.
    #[must_use]
    pub const fn failure_summary(self) -> &'static str {
        match self {
            Self::ErrorScan => "Non-ignorable errors detected",
            Self::InvalidObjects => "Invalid object mismatch detected",
            Self::ExecutionIntegrity => "Execution start/end mismatch detected",
        }
    }
}

/// A problem that prevented a check from evaluating its log.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum CheckProblem {
    /// The log as a whole could not be parsed.
    #[error("cannot parse {}: {reason}", path.display())]
    LogParse {
        /// Log path.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// The log could not be read.
    #[error("cannot read {}: {reason}", path.display())]
    IoFailure {
        /// Log path.
        path: PathBuf,
        /// Underlying error message.
        reason: String,
    },
}

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    /// Which check.
    pub kind: CheckKind,
    /// Whether it passed.
    pub passed: bool,
    /// Human-readable detail.
    pub detail: String,
    /// Parse or I/O problem, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<CheckProblem>,
}

/// A non-ignorable error code found in a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unit being executed when the error appeared.
    pub unit: Option<String>,
    /// Upper-cased error code.
    pub code: String,
    /// The full log line.
    pub message: String,
    /// Log filename.
    pub file: String,
}

/// An object not in a healthy state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidObject {
    /// Object name.
    pub name: String,
    /// Object type (e.g. `PACKAGE BODY`).
    pub object_type: String,
}

/// Outcome of validating one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    /// `PASS` or `FAIL`.
    pub status: VerdictStatus,
    /// One-line summary.
    pub summary: String,
    /// Non-ignorable errors in log order.
    pub errors: Vec<ErrorRecord>,
    /// Invalid objects in log order, de-duplicated.
    pub invalid_objects: Vec<InvalidObject>,
    /// Units started but never terminated.
    pub dropped_units: Vec<String>,
    /// Units terminated without a start.
    pub orphaned_units: Vec<String>,
    /// `Number of invalids at start`.
    pub invalid_count_start: Option<u64>,
    /// `Number of invalids at end`.
    pub invalid_count_end: Option<u64>,
    /// One report per check, in check order.
    pub checks: Vec<CheckReport>,
}

impl ValidationVerdict {
    /// Whether the verdict is `PASS`.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == VerdictStatus::Pass
    }

    /// Report of a specific check.
    #[must_use]
    pub fn check(&self, kind: CheckKind) -> Option<&CheckReport> {
        self.checks.iter().find(|c| c.kind == kind)
    }
}

/// Runs the deployment checks.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    ignorable: BTreeSet<String>,
}

impl Validator {
    /// Create a validator ignoring the given error codes (case-insensitive).
    #[must_use]
    pub fn new<I, S>(ignorable: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            ignorable: ignorable
                .into_iter()
                .map(|code| code.as_ref().trim().to_ascii_uppercase())
                .collect(),
        }
    }

    /// Validate an extracted package.
    #[must_use]
    pub fn validate_package(&self, package: &ExtractedPackage) -> ValidationVerdict {
        self.validate(
            package.primary_log(),
            package.secondary_log(),
            package.tertiary_log(),
        )
    }

    /// Validate a set of logs.
    #[must_use]
    pub fn validate(
        &self,
        primary: &Path,
        secondary: &Path,
        tertiary: Option<&Path>,
    ) -> ValidationVerdict {
        let errors = checks::error_scan(primary, tertiary, &self.ignorable);
        let invalids = checks::invalid_objects(secondary);
        let integrity = checks::execution_integrity(primary);

        let reports: Vec<CheckReport> = [&errors, &invalids, &integrity]
            .into_iter()
            .filter_map(|o| o.report.clone())
            .collect();
        let failed: Vec<&'static str> = reports
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.kind.failure_summary())
            .collect();

        let (status, summary) = if failed.is_empty() {
            (VerdictStatus::Pass, PASS_SUMMARY.to_string())
        } else {
            (VerdictStatus::Fail, failed.join("; "))
        };

        info!(
            primary = %primary.display(),
            %status,
            errors = errors.errors.len(),
            invalid_objects = invalids.invalid_objects.len(),
            dropped_units = integrity.dropped_units.len(),
            "validation finished"
        );

        ValidationVerdict {
            status,
            summary,
            errors: errors.errors,
            invalid_objects: invalids.invalid_objects,
            dropped_units: integrity.dropped_units,
            orphaned_units: integrity.orphaned_units,
            invalid_count_start: invalids.invalid_count_start,
            invalid_count_end: invalids.invalid_count_end,
            checks: reports,
        }
    }
}
