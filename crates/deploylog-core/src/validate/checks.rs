//! The three deployment checks.
//!
//! Each check reads its own logs and returns a [`CheckOutcome`]; none of
//! them depends on another's result.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::{debug, warn};

use super::grammar::{self, InvalidCount, MarkerKind, RowParse};
use super::{CheckKind, CheckProblem, CheckReport, ErrorRecord, InvalidObject};

/// Findings of a single check.
#[derive(Debug, Default)]
pub(super) struct CheckOutcome {
    pub errors: Vec<ErrorRecord>,
    pub invalid_objects: Vec<InvalidObject>,
    pub invalid_count_start: Option<u64>,
    pub invalid_count_end: Option<u64>,
    pub dropped_units: Vec<String>,
    pub orphaned_units: Vec<String>,
    pub report: Option<CheckReport>,
}

fn file_label(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |n| n.to_string_lossy().into_owned(),
    )
}

fn io_problem(path: &Path, e: &std::io::Error) -> CheckProblem {
    CheckProblem::IoFailure {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Scan the primary log and, if present, the tertiary log for error codes.
pub(super) fn error_scan(
    primary: &Path,
    tertiary: Option<&Path>,
    ignorable: &BTreeSet<String>,
) -> CheckOutcome {
    let mut outcome = CheckOutcome::default();
    let mut problem = None;

    for path in std::iter::once(primary).chain(tertiary) {
        let content = match grammar::read_lossy(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read log for error scan");
                problem.get_or_insert_with(|| io_problem(path, &e));
                continue;
            },
        };

        let file = file_label(path);
        let mut current_unit: Option<String> = None;
        let mut ignored = 0usize;
        for line in content.lines() {
            if let Some(marker) = grammar::parse_marker(line) {
                if marker.kind == MarkerKind::Start {
                    current_unit = Some(marker.unit);
                }
            }
            for code in grammar::error_codes(line) {
                if ignorable.contains(&code) {
                    ignored += 1;
                    continue;
                }
                outcome.errors.push(ErrorRecord {
                    unit: current_unit.clone(),
                    code,
                    message: line.trim().to_string(),
                    file: file.clone(),
                });
            }
        }
        debug!(path = %path.display(), ignored, "error scan finished");
    }

    let passed = problem.is_none() && outcome.errors.is_empty();
    let detail = if outcome.errors.is_empty() {
        "no non-ignorable errors".to_string()
    } else {
        format!("{} non-ignorable error(s)", outcome.errors.len())
    };
    outcome.report = Some(CheckReport {
        kind: CheckKind::ErrorScan,
        passed,
        detail,
        problem,
    });
    outcome
}

/// Collect invalid objects and compare the summary counts.
pub(super) fn invalid_objects(secondary: &Path) -> CheckOutcome {
    let mut outcome = CheckOutcome::default();

    let content = match grammar::read_lossy(secondary) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %secondary.display(), error = %e, "cannot read invalids log");
            outcome.report = Some(CheckReport {
                kind: CheckKind::InvalidObjects,
                passed: false,
                detail: "invalids log unreadable".to_string(),
                problem: Some(io_problem(secondary, &e)),
            });
            return outcome;
        },
    };

    let mut seen = BTreeSet::new();
    let mut rows = 0usize;
    for (index, line) in content.lines().enumerate() {
        if let Some(count) = grammar::parse_invalid_count(line) {
            match count {
                InvalidCount::Start(n) => outcome.invalid_count_start = Some(n),
                InvalidCount::End(n) => outcome.invalid_count_end = Some(n),
            }
            continue;
        }
        match grammar::parse_object_row(line) {
            RowParse::Row(row) => {
                rows += 1;
                if row.is_ok() {
                    continue;
                }
                if seen.insert((row.name.clone(), row.object_type.clone())) {
                    outcome.invalid_objects.push(InvalidObject {
                        name: row.name,
                        object_type: row.object_type,
                    });
                }
            },
            RowParse::Malformed => {
                warn!(
                    path = %secondary.display(),
                    line = index + 1,
                    "malformed object status row skipped"
                );
            },
            RowParse::NotARow => {},
        }
    }

    let counts = (outcome.invalid_count_start, outcome.invalid_count_end);
    let problem = match counts {
        (None, None) if rows == 0 => Some(CheckProblem::LogParse {
            path: secondary.to_path_buf(),
            reason: "no invalid-count summary and no object status rows".to_string(),
        }),
        (Some(_), None) | (None, Some(_)) => Some(CheckProblem::LogParse {
            path: secondary.to_path_buf(),
            reason: "incomplete invalid-count summary".to_string(),
        }),
        _ => None,
    };

    let mut details = Vec::new();
    if !outcome.invalid_objects.is_empty() {
        details.push(format!(
            "{} invalid object(s)",
            outcome.invalid_objects.len()
        ));
    }
    if let (Some(start), Some(end)) = counts {
        if start != end {
            details.push(format!("invalid count changed from {start} to {end}"));
        }
    }
    let passed = problem.is_none() && details.is_empty();
    if passed {
        details.push("no invalid objects".to_string());
    }

    outcome.report = Some(CheckReport {
        kind: CheckKind::InvalidObjects,
        passed,
        detail: details.join("; "),
        problem,
    });
    outcome
}

/// Cross-reference start markers against end/skipped markers.
pub(super) fn execution_integrity(primary: &Path) -> CheckOutcome {
    let mut outcome = CheckOutcome::default();

    let content = match grammar::read_lossy(primary) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %primary.display(), error = %e, "cannot read log for integrity check");
            outcome.report = Some(CheckReport {
                kind: CheckKind::ExecutionIntegrity,
                passed: false,
                detail: "primary log unreadable".to_string(),
                problem: Some(io_problem(primary, &e)),
            });
            return outcome;
        },
    };

    // unit -> (first appearance, starts, terminals)
    let mut units: BTreeMap<String, (usize, usize, usize)> = BTreeMap::new();
    for marker in content.lines().filter_map(grammar::parse_marker) {
        let next = units.len();
        let entry = units.entry(marker.unit).or_insert((next, 0, 0));
        if marker.kind.is_terminal() {
            entry.2 += 1;
        } else {
            entry.1 += 1;
        }
    }

    let mut ordered: Vec<_> = units.into_iter().collect();
    ordered.sort_by_key(|(_, (first, _, _))| *first);
    for (unit, (_, starts, terminals)) in ordered {
        if starts > terminals {
            outcome.dropped_units.push(unit);
        } else if terminals > starts {
            outcome.orphaned_units.push(unit);
        }
    }

    let passed = outcome.dropped_units.is_empty() && outcome.orphaned_units.is_empty();
    let detail = if passed {
        "every started unit terminated".to_string()
    } else {
        format!(
            "{} dropped unit(s), {} orphaned unit(s)",
            outcome.dropped_units.len(),
            outcome.orphaned_units.len()
        )
    };
    outcome.report = Some(CheckReport {
        kind: CheckKind::ExecutionIntegrity,
        passed,
        detail,
        problem: None,
    });
    outcome
}
