//! File-spool transport.
//!
//! Writes each notification as a plain-text `.eml` message into an outbox
//! directory. A mail relay (or an operator) picks messages up from there.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use tempfile::NamedTempFile;

use super::{DeliveryError, Notification, Transport, is_valid_address};

/// Transport that spools messages into a directory.
#[derive(Debug)]
pub struct SpoolTransport {
    outbox: PathBuf,
    sequence: AtomicU32,
}

impl SpoolTransport {
    /// Create a spool transport writing into `outbox`.
    #[must_use]
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
            sequence: AtomicU32::new(0),
        }
    }

    /// The outbox directory.
    #[must_use]
    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    fn render(message: &Notification) -> String {
        let subject = message.subject.replace(['\r', '\n'], " ");
        format!(
            "To: {}\r\nSubject: {}\r\nDate: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            message.recipients.join("; "),
            subject,
            Utc::now().to_rfc2822(),
            message.body.replace('\n', "\r\n"),
        )
    }
}

impl Transport for SpoolTransport {
    fn name(&self) -> &'static str {
        "spool"
    }

    fn deliver(&self, message: &Notification) -> Result<(), DeliveryError> {
        if message.recipients.is_empty() {
            return Err(DeliveryError::Permanent {
                reason: "no recipients configured".to_string(),
            });
        }
        if let Some(bad) = message.recipients.iter().find(|r| !is_valid_address(r)) {
            return Err(DeliveryError::Permanent {
                reason: format!("malformed recipient address: {bad}"),
            });
        }

        std::fs::create_dir_all(&self.outbox).map_err(|e| DeliveryError::Transient {
            reason: format!("cannot create outbox {}: {e}", self.outbox.display()),
        })?;

        let mut staged = NamedTempFile::new_in(&self.outbox).map_err(|e| {
            DeliveryError::Transient {
                reason: format!("cannot stage message: {e}"),
            }
        })?;
        staged
            .write_all(Self::render(message).as_bytes())
            .and_then(|()| staged.as_file().sync_all())
            .map_err(|e| DeliveryError::Transient {
                reason: format!("cannot write message: {e}"),
            })?;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let file_name = format!(
            "{}-{seq:04}.eml",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        );
        staged
            .persist_noclobber(self.outbox.join(file_name))
            .map_err(|e| DeliveryError::Transient {
                reason: format!("cannot publish message: {}", e.error),
            })?;
        Ok(())
    }
}
