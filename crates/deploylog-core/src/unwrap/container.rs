//! Outlook `.msg` attachment extraction.
//!
//! A `.msg` file is an OLE compound document. Each attachment lives in a
//! root-level storage named `__attach_version1.0_#XXXXXXXX` holding the
//! filename and data as MAPI property streams.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::UnwrapError;
use crate::archive::suffixed_name;

const ATTACHMENT_PREFIX: &str = "__attach_version1.0_#";

/// `PR_ATTACH_LONG_FILENAME` (Unicode, then ANSI), then
/// `PR_ATTACH_FILENAME` (Unicode, then ANSI).
const FILENAME_STREAMS: [(&str, bool); 4] = [
    ("__substg1.0_3707001F", true),
    ("__substg1.0_3707001E", false),
    ("__substg1.0_3704001F", true),
    ("__substg1.0_3704001E", false),
];

/// `PR_ATTACH_DATA_BIN`.
const DATA_STREAM: &str = "__substg1.0_37010102";

/// Upper bound on suffixed names tried for one attachment.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Upper bound on a filename property stream.
const MAX_NAME_BYTES: u64 = 64 * 1024;

/// Extract every `.zip` attachment of `container` into `dest_dir`.
///
/// Attachment data is bounded by `max_bytes` in total; the declared stream
/// length is checked before anything is read.
///
/// Returns the paths of the extracted (or already present, identical)
/// archives in attachment order.
pub fn unwrap_container(
    container: &Path,
    dest_dir: &Path,
    max_bytes: u64,
) -> Result<Vec<PathBuf>, UnwrapError> {
    let format_err = |reason: String| UnwrapError::ContainerFormat {
        path: container.to_path_buf(),
        reason,
    };

    let mut compound = cfb::open(container).map_err(|e| format_err(e.to_string()))?;

    let attachments: Vec<PathBuf> = compound
        .read_root_storage()
        .filter(|entry| entry.is_storage() && entry.name().starts_with(ATTACHMENT_PREFIX))
        .map(|entry| entry.path().to_path_buf())
        .collect();
    debug!(container = %container.display(), attachments = attachments.len(), "container parsed");

    let mut extracted = Vec::new();
    let mut total: u64 = 0;
    for storage in attachments {
        let Some(raw_name) = read_attachment_name(&mut compound, &storage) else {
            debug!(storage = %storage.display(), "attachment without filename skipped");
            continue;
        };
        let Some(name) = attachment_basename(&raw_name) else {
            warn!(attachment = %raw_name, "unusable attachment filename skipped");
            continue;
        };
        if !name.to_ascii_lowercase().ends_with(".zip") {
            debug!(attachment = %name, "non-archive attachment skipped");
            continue;
        }

        let unreadable = |e: std::io::Error| {
            format_err(format!("attachment '{name}' has no readable data: {e}"))
        };
        let mut stream = compound
            .open_stream(storage.join(DATA_STREAM))
            .map_err(unreadable)?;
        total = total.saturating_add(stream.len());
        if total > max_bytes {
            warn!(
                container = %container.display(),
                attachment = %name,
                bytes = stream.len(),
                "attachment data exceeds limit"
            );
            return Err(UnwrapError::ExtractionLimit {
                path: container.to_path_buf(),
                reason: format!("attachment data exceeds {max_bytes} bytes"),
            });
        }
        let mut data = Vec::new();
        stream.read_to_end(&mut data).map_err(unreadable)?;
        let path = store_attachment(dest_dir, name, &data)?;
        info!(container = %container.display(), archive = %path.display(), "archive attachment extracted");
        extracted.push(path);
    }

    Ok(extracted)
}

fn read_name_stream<F: Read + std::io::Seek>(
    compound: &mut cfb::CompoundFile<F>,
    path: &Path,
) -> std::io::Result<Vec<u8>> {
    let stream = compound.open_stream(path)?;
    let mut data = Vec::new();
    stream.take(MAX_NAME_BYTES).read_to_end(&mut data)?;
    Ok(data)
}

fn read_attachment_name<F: Read + std::io::Seek>(
    compound: &mut cfb::CompoundFile<F>,
    storage: &Path,
) -> Option<String> {
    FILENAME_STREAMS.iter().find_map(|(stream, unicode)| {
        let path = storage.join(stream);
        if !compound.is_stream(&path) {
            return None;
        }
        let bytes = read_name_stream(compound, &path).ok()?;
        let name = if *unicode {
            decode_utf16le(&bytes)
        } else {
            String::from_utf8_lossy(&bytes).into_owned()
        };
        let name = name.trim_end_matches('\0').trim().to_string();
        (!name.is_empty()).then_some(name)
    })
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Final path component of an attachment name, or `None` if unusable.
fn attachment_basename(name: &str) -> Option<&str> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    match base {
        "" | "." | ".." => None,
        b if b.contains(['\0', ':']) => None,
        b => Some(b),
    }
}

fn sha256_of(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Write `data` as `dest_dir/name` without clobbering.
///
/// An existing file with identical content is reused; otherwise the first
/// free `{stem}_{N}{ext}` name is taken.
fn store_attachment(dest_dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf, UnwrapError> {
    std::fs::create_dir_all(dest_dir)
        .map_err(|e| UnwrapError::io(format!("creating {}", dest_dir.display()), e))?;

    let digest = sha256_of(data);
    let mut staged = NamedTempFile::new_in(dest_dir)
        .map_err(|e| UnwrapError::io(format!("staging attachment {name}"), e))?;
    staged
        .write_all(data)
        .and_then(|()| staged.as_file().sync_all())
        .map_err(|e| UnwrapError::io(format!("writing attachment {name}"), e))?;

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 0 {
            dest_dir.join(name)
        } else {
            dest_dir.join(suffixed_name(name, attempt))
        };

        if candidate.exists() {
            match std::fs::read(&candidate) {
                Ok(existing) if sha256_of(&existing) == digest => {
                    debug!(path = %candidate.display(), "identical attachment already present");
                    return Ok(candidate);
                },
                Ok(_) => continue,
                Err(e) => {
                    return Err(UnwrapError::io(
                        format!("reading {}", candidate.display()),
                        e,
                    ));
                },
            }
        }

        match staged.persist_noclobber(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                staged = e.file;
            },
            Err(e) => {
                return Err(UnwrapError::io(
                    format!("publishing {}", candidate.display()),
                    e.error,
                ));
            },
        }
    }

    Err(UnwrapError::io(
        format!("no free name for attachment {name}"),
        std::io::Error::new(std::io::ErrorKind::AlreadyExists, "name space exhausted"),
    ))
}
