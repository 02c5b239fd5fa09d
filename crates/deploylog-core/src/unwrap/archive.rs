//! Sandboxed zip extraction.
//!
//! # Security Model
//!
//! - **Validate first**: every entry name is resolved before the first byte
//!   is written. One bad entry fails the whole archive.
//! - **Component-wise resolution**: names are split on both `/` and `\`;
//!   `.` is dropped, `..` pops a component and fails if nothing is left to
//!   pop. Names are never compared as strings.
//! - **No absolute names**: leading separators, drive letters and UNC
//!   prefixes are rejected.
//! - **No links**: symlink entries are rejected outright.
//! - **Canonical containment**: after parent directories are created, the
//!   canonical parent must be a descendant of the canonical sandbox root
//!   (`Path::starts_with`, component-wise).
//! - **No clobbering**: files are created with `create_new`.
//!
//! Extracted files keep the modification time recorded in the archive so
//! that duplicate logs can be ranked by when they were written, not by
//! extraction order.
//!
//! # Invariants
//!
//! - [INV-UNZIP-001] No file is created outside the sandbox root.
//! - [INV-UNZIP-002] Entry count and total extracted bytes are bounded by
//!   [`ExtractLimits`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::NaiveDate;
use tracing::{debug, warn};
use zip::ZipArchive;

use super::UnwrapError;

/// Unix file type mask and symlink type bits.
const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Bounds applied to a single archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractLimits {
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Maximum total uncompressed bytes.
    pub max_bytes: u64,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Resolve an entry name to a relative path inside the sandbox.
///
/// Returns `Ok(None)` for names that resolve to the sandbox root itself
/// (for example `./`).
pub fn sanitize_entry_name(name: &str) -> Result<Option<PathBuf>, UnwrapError> {
    let reject = |reason| UnwrapError::PathTraversal {
        entry: name.to_string(),
        reason,
    };

    if name.contains('\0') {
        return Err(reject("NUL byte in name"));
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return Err(reject("absolute path"));
    }

    let mut parts: Vec<&str> = Vec::new();
    for (index, part) in name.split(['/', '\\']).enumerate() {
        match part {
            "" | "." => {},
            ".." => {
                if parts.pop().is_none() {
                    return Err(reject("parent directory above root"));
                }
            },
            _ => {
                if index == 0 && part.contains(':') {
                    return Err(reject("drive prefix"));
                }
                parts.push(part);
            },
        }
    }

    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.iter().collect()))
}

fn is_symlink_mode(mode: Option<u32>) -> bool {
    mode.is_some_and(|m| m & S_IFMT == S_IFLNK)
}

/// Convert a zip entry timestamp to a `SystemTime`.
///
/// Zip timestamps carry no zone; they are read as UTC. Returns `None` for
/// out-of-range fields, which some writers emit for unset times.
fn entry_mtime(stamp: zip::DateTime) -> Option<SystemTime> {
    let naive = NaiveDate::from_ymd_opt(
        i32::from(stamp.year()),
        u32::from(stamp.month()),
        u32::from(stamp.day()),
    )?
    .and_hms_opt(
        u32::from(stamp.hour()),
        u32::from(stamp.minute()),
        u32::from(stamp.second()),
    )?;
    Some(SystemTime::from(naive.and_utc()))
}

struct PlannedEntry {
    index: usize,
    relative: PathBuf,
    is_dir: bool,
}

/// Extract `archive` into `root`, which must be an existing empty directory.
///
/// Returns the paths of the extracted files.
pub fn extract_zip(
    archive: &Path,
    root: &Path,
    limits: ExtractLimits,
) -> Result<Vec<PathBuf>, UnwrapError> {
    let corrupt = |source| UnwrapError::CorruptArchive {
        path: archive.to_path_buf(),
        source,
    };
    let limit = |reason: String| UnwrapError::ExtractionLimit {
        path: archive.to_path_buf(),
        reason,
    };

    let file = File::open(archive)
        .map_err(|e| UnwrapError::io(format!("opening {}", archive.display()), e))?;
    let mut zip = ZipArchive::new(file).map_err(corrupt)?;

    if zip.len() > limits.max_entries {
        return Err(limit(format!(
            "{} entries, maximum is {}",
            zip.len(),
            limits.max_entries
        )));
    }

    // Pass 1: validate every name and the declared sizes.
    let mut plan = Vec::with_capacity(zip.len());
    let mut declared: u64 = 0;
    for index in 0..zip.len() {
        let entry = zip.by_index_raw(index).map_err(corrupt)?;
        let name = entry.name().to_string();
        if is_symlink_mode(entry.unix_mode()) {
            return Err(UnwrapError::PathTraversal {
                entry: name,
                reason: "symbolic link entry",
            });
        }
        let Some(relative) = sanitize_entry_name(&name)? else {
            continue;
        };
        declared = declared.saturating_add(entry.size());
        if declared > limits.max_bytes {
            return Err(limit(format!(
                "declared size exceeds {} bytes",
                limits.max_bytes
            )));
        }
        plan.push(PlannedEntry {
            index,
            relative,
            is_dir: entry.is_dir(),
        });
    }

    let canonical_root = root
        .canonicalize()
        .map_err(|e| UnwrapError::io(format!("resolving {}", root.display()), e))?;

    // Pass 2: write.
    let mut written: u64 = 0;
    let mut extracted = Vec::new();
    for planned in plan {
        let target = canonical_root.join(&planned.relative);
        let parent_dir = if planned.is_dir {
            target.clone()
        } else {
            match target.parent() {
                Some(p) => p.to_path_buf(),
                None => canonical_root.clone(),
            }
        };

        fs::create_dir_all(&parent_dir)
            .map_err(|e| UnwrapError::io(format!("creating {}", parent_dir.display()), e))?;
        let canonical_parent = parent_dir
            .canonicalize()
            .map_err(|e| UnwrapError::io(format!("resolving {}", parent_dir.display()), e))?;
        if !canonical_parent.starts_with(&canonical_root) {
            warn!(
                archive = %archive.display(),
                entry = %planned.relative.display(),
                "entry parent resolves outside the sandbox"
            );
            return Err(UnwrapError::PathTraversal {
                entry: planned.relative.display().to_string(),
                reason: "resolved parent outside sandbox",
            });
        }
        if planned.is_dir {
            continue;
        }

        let mut entry = zip.by_index(planned.index).map_err(corrupt)?;
        let modified = entry.last_modified().and_then(entry_mtime);
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .map_err(|e| UnwrapError::io(format!("creating {}", target.display()), e))?;

        let remaining = limits.max_bytes.saturating_sub(written);
        let copied = io::copy(&mut (&mut entry).take(remaining.saturating_add(1)), &mut out)
            .map_err(|e| UnwrapError::io(format!("extracting {}", target.display()), e))?;
        written = written.saturating_add(copied);
        if written > limits.max_bytes {
            return Err(limit(format!(
                "extracted data exceeds {} bytes",
                limits.max_bytes
            )));
        }

        if let Some(mtime) = modified {
            if let Err(e) = out.set_modified(mtime) {
                warn!(
                    entry = %planned.relative.display(),
                    error = %e,
                    "failed to keep archived modification time"
                );
            }
        } else {
            debug!(entry = %planned.relative.display(), "entry has no usable timestamp");
        }

        debug!(entry = %planned.relative.display(), bytes = copied, "extracted");
        extracted.push(target);
    }

    Ok(extracted)
}
