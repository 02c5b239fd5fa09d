#![allow(clippy::doc_markdown)]

//! deploylog-core - Deployment log ingestion, validation and archival
//!
//! This library implements the pipeline that takes deployment-log packages
//! dropped into a watched directory (zip archives, or zip attachments inside
//! Outlook `.msg` containers), validates the Oracle deployment logs they
//! carry, extracts the ticket-to-unit audit trail, and files the result into
//! a weekly archive hierarchy.
//!
//! # Pipeline
//!
//! ```text
//! DirectoryScanner -> FingerprintStore -> unwrap -> Validator
//!     -> AuditExtractor -> Archiver -> Notifier
//! ```
//!
//! Every input file is processed end-to-end by a single worker before the
//! next one starts. Fingerprints are recorded only after archival succeeded,
//! so a crash mid-run causes the file to be retried on the next poll.
//!
//! # Modules
//!
//! - [`config`]: Validated TOML configuration
//! - [`fingerprint`]: Processed-file ledger keyed by name and (size, mtime)
//! - [`unwrap`]: `.msg` attachment extraction and sandboxed zip extraction
//! - [`validate`]: The three independent deployment checks
//! - [`audit`]: Ticket to unit mapping
//! - [`cycle`]: Friday-anchored weekly cycle naming
//! - [`archive`]: Append-only archival of packages and reports
//! - [`notify`]: Templated notifications with bounded retries
//! - [`pipeline`]: One archive end-to-end with stage-tagged errors
//! - [`monitor`]: Polling loop, stop signal, activity feed and status cell

pub mod archive;
pub mod audit;
pub mod config;
pub mod cycle;
pub mod fingerprint;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod unwrap;
pub mod validate;

pub use archive::{ArchiveError, ArchiveRecord, Archiver};
pub use audit::{AuditExtractor, AuditMapping};
pub use config::{ConfigError, MonitorConfig};
pub use cycle::{DeploymentCycle, cycle_name};
pub use fingerprint::{Fingerprint, FingerprintStore};
pub use monitor::{IngestLoop, MonitorHandle, spawn_monitor};
pub use pipeline::{Pipeline, PipelineError, RunReport};
pub use unwrap::{ExtractedPackage, UnwrapError};
pub use validate::{ValidationVerdict, Validator, VerdictStatus};
