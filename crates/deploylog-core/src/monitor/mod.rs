//! Ingestion loop.
//!
//! One worker thread polls the watched directory and drives each ready file
//! through the [`Pipeline`], one file at a time.
//!
//! # Cancellation
//!
//! The [`StopSignal`] is checked at the top of every iteration and before
//! each file. A file that has started processing always runs to completion
//! or failure; the poll sleep is interrupted immediately.
//!
//! # Recording policy
//!
//! - Archive processed successfully (PASS or FAIL verdict): recorded.
//! - Container: every extracted zip that is still eligible is processed
//!   and recorded on its own; the container is recorded once none of them
//!   failed with a retryable error.
//! - Path traversal: recorded as permanently rejected.
//! - Any other failure: left unrecorded and retried on the next poll.

mod channel;
mod scanner;

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{Local, NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use channel::{
    ActivityFeed, ActivityLevel, ActivityLine, LastVerdict, MonitorState, MonitorStatus,
    StatusCell, StopSignal,
};
pub use scanner::DirectoryScanner;

use crate::config::MonitorConfig;
use crate::fingerprint::{FileKind, FingerprintStore, IncomingFile, StoreError};
use crate::pipeline::{Pipeline, PipelineError};

/// Errors that stop the monitor from starting or scanning.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MonitorError {
    /// The watched directory could not be listed.
    #[error("cannot scan {}: {source}", path.display())]
    Scan {
        /// Watched directory.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The fingerprint store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The worker thread could not be spawned.
    #[error("cannot spawn monitor thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Counters for one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Files that went through the whole pipeline.
    pub processed: usize,
    /// Files whose run failed and will be retried.
    pub failed: usize,
    /// Files permanently rejected.
    pub rejected: usize,
}

enum Outcome {
    Done,
    Retry,
    Rejected,
}

/// The polling worker.
#[derive(Debug)]
pub struct IngestLoop {
    pipeline: Pipeline,
    store: FingerprintStore,
    scanner: DirectoryScanner,
    poll_interval: Duration,
    feed: ActivityFeed,
    status: StatusCell,
    stop: StopSignal,
    today: fn() -> NaiveDate,
}

fn local_today() -> NaiveDate {
    Local::now().date_naive()
}

impl IngestLoop {
    /// Assemble a loop from its parts.
    #[must_use]
    pub fn new(
        pipeline: Pipeline,
        store: FingerprintStore,
        scanner: DirectoryScanner,
        poll_interval: Duration,
    ) -> Self {
        let (feed, _) = ActivityFeed::bounded(1);
        Self {
            pipeline,
            store,
            scanner,
            poll_interval,
            feed,
            status: StatusCell::new(),
            stop: StopSignal::new(),
            today: local_today,
        }
    }

    /// Build the loop described by `config`.
    pub fn from_config(config: &MonitorConfig) -> Result<Self, MonitorError> {
        let store = match &config.monitor.state_file {
            Some(path) => FingerprintStore::open(path)?,
            None => FingerprintStore::in_memory(),
        };
        let scanner = DirectoryScanner::new(
            &config.monitor.watch_dir,
            &config.monitor.container_extension,
        )
        .with_settle_polls(config.monitor.settle_polls);
        Ok(Self::new(
            Pipeline::from_config(config),
            store,
            scanner,
            config.poll_interval(),
        ))
    }

    /// Publish activity into `feed`.
    #[must_use]
    pub fn with_feed(mut self, feed: ActivityFeed) -> Self {
        self.feed = feed;
        self
    }

    /// Publish status into `status`.
    #[must_use]
    pub fn with_status(mut self, status: StatusCell) -> Self {
        self.status = status;
        self
    }

    /// Observe `stop` for cancellation.
    #[must_use]
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Use `today` as the processing-date source.
    #[must_use]
    pub fn with_date_source(mut self, today: fn() -> NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// The fingerprint store.
    #[must_use]
    pub const fn store(&self) -> &FingerprintStore {
        &self.store
    }

    /// Scan once and process every ready file.
    pub fn poll_once(&mut self) -> Result<PollSummary, MonitorError> {
        let files = self
            .scanner
            .scan(&self.store)
            .map_err(|source| MonitorError::Scan {
                path: self.scanner.watch_dir().to_path_buf(),
                source,
            })?;

        let mut summary = PollSummary::default();
        for file in files {
            if self.stop.is_stopped() {
                info!("stop requested, leaving remaining files for the next run");
                break;
            }
            // An earlier container in this poll may already have handled it.
            if !self.store.is_eligible(&file) {
                debug!(file = %file.name, "already recorded during this poll");
                continue;
            }
            self.status.set_state(MonitorState::Processing {
                file: file.name.clone(),
            });
            self.feed.info(format!("Processing {}", file.name));

            let outcome = match file.kind {
                FileKind::Archive => self.process_archive_file(&file),
                FileKind::Container => self.process_container(&file),
            };
            match outcome {
                Outcome::Done => summary.processed += 1,
                Outcome::Retry => summary.failed += 1,
                Outcome::Rejected => summary.rejected += 1,
            }
            self.status.set_state(MonitorState::Idle);
        }
        Ok(summary)
    }

    /// Poll until stopped.
    pub fn run(&mut self) {
        info!(
            watch_dir = %self.scanner.watch_dir().display(),
            interval_secs = self.poll_interval.as_secs(),
            "monitor started"
        );
        self.feed
            .info(format!("Monitoring {}", self.scanner.watch_dir().display()));
        self.status.set_state(MonitorState::Idle);

        loop {
            if self.stop.is_stopped() {
                break;
            }
            if let Err(e) = self.poll_once() {
                warn!(error = %e, "poll failed");
                self.feed.warn(e.to_string());
            }
            if self.stop.wait_timeout(self.poll_interval) {
                break;
            }
        }

        self.status.set_state(MonitorState::Stopped);
        self.feed.info("Monitor stopped");
        info!("monitor stopped");
    }

    fn process_archive_file(&mut self, file: &IncomingFile) -> Outcome {
        match self.pipeline.process_archive(&file.path, (self.today)()) {
            Ok(report) => {
                self.feed.info(format!(
                    "{} {}/{}: {} ({})",
                    report.verdict.status,
                    report.cluster,
                    report.instance,
                    report.verdict.summary,
                    report.record.destination.display()
                ));
                if report.notified == Some(false) {
                    self.feed.warn(format!("Notification for {} failed", file.name));
                }
                self.status.record_verdict(LastVerdict {
                    file: file.name.clone(),
                    status: report.verdict.status,
                    summary: report.verdict.summary.clone(),
                    at: Utc::now(),
                });
                self.record(file);
                Outcome::Done
            },
            Err(e) => self.handle_failure(file, &e),
        }
    }

    fn process_container(&mut self, file: &IncomingFile) -> Outcome {
        let archives = match self
            .pipeline
            .unwrap_container(&file.path, self.scanner.watch_dir())
        {
            Ok(archives) => archives,
            Err(e) => return self.handle_failure(file, &e),
        };
        self.feed.info(format!(
            "{} contained {} archive(s)",
            file.name,
            archives.len()
        ));

        let mut retry = false;
        for archive in archives {
            let Some(inner) = self.describe_extracted(&archive) else {
                retry = true;
                continue;
            };
            if !self.store.is_eligible(&inner) {
                continue;
            }
            if matches!(self.process_archive_file(&inner), Outcome::Retry) {
                retry = true;
            }
        }

        if retry {
            Outcome::Retry
        } else {
            self.record(file);
            Outcome::Done
        }
    }

    fn describe_extracted(&self, path: &Path) -> Option<IncomingFile> {
        match self.scanner.describe(path) {
            Ok(Some(file)) => Some(file),
            Ok(None) => {
                warn!(path = %path.display(), "extracted attachment is not an archive");
                None
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot stat extracted archive");
                None
            },
        }
    }

    fn handle_failure(&mut self, file: &IncomingFile, err: &PipelineError) -> Outcome {
        error!(
            file = %file.name,
            stage = %err.stage,
            kind = err.kind.name(),
            error = %err,
            "pipeline run failed"
        );
        self.feed.error(format!(
            "{} failed at {} ({}): {}",
            file.name,
            err.stage,
            err.kind.name(),
            err.kind
        ));
        self.status.record_failure();

        if err.is_permanent_rejection() {
            warn!(file = %file.name, "file permanently rejected");
            self.feed.warn(format!("{} permanently rejected", file.name));
            self.record(file);
            Outcome::Rejected
        } else {
            Outcome::Retry
        }
    }

    fn record(&mut self, file: &IncomingFile) {
        let fp = file.fingerprint;
        if let Err(e) = self.store.record(&file.name, fp.size, fp.modified) {
            warn!(file = %file.name, error = %e, "cannot persist fingerprint");
            self.feed.warn(format!("Cannot persist fingerprint: {e}"));
        }
    }
}

/// Handle to a running monitor thread.
#[derive(Debug)]
pub struct MonitorHandle {
    stop: StopSignal,
    status: StatusCell,
    activity: Option<Receiver<ActivityLine>>,
    thread: JoinHandle<()>,
}

impl MonitorHandle {
    /// Request a stop. The current file finishes first.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// The stop signal, for wiring into signal handlers.
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        self.status.snapshot()
    }

    /// Shared status slot, readable after the handle is joined.
    #[must_use]
    pub fn status_cell(&self) -> StatusCell {
        self.status.clone()
    }

    /// Take the activity receiver. Returns `None` after the first call.
    pub fn take_activity(&mut self) -> Option<Receiver<ActivityLine>> {
        self.activity.take()
    }

    /// Whether the worker has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the worker to exit.
    ///
    /// Returns `false` if the worker panicked.
    pub fn join(self) -> bool {
        self.thread.join().is_ok()
    }
}

/// Start the monitor described by `config` on its own thread.
pub fn spawn_monitor(config: &MonitorConfig) -> Result<MonitorHandle, MonitorError> {
    let (feed, activity) = ActivityFeed::bounded(config.monitor.activity_capacity);
    let status = StatusCell::new();
    let stop = StopSignal::new();

    let mut ingest = IngestLoop::from_config(config)?
        .with_feed(feed)
        .with_status(status.clone())
        .with_stop(stop.clone());

    let thread = std::thread::Builder::new()
        .name("deploylog-monitor".to_string())
        .spawn(move || ingest.run())
        .map_err(MonitorError::Spawn)?;

    Ok(MonitorHandle {
        stop,
        status,
        activity: Some(activity),
        thread,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Write;

    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    use super::*;
    use crate::unwrap::{Unwrapper, build_msg};
    use crate::validate::Validator;

    const PRIMARY: &str = "/d/PKG_A.sql - execution start\n/d/PKG_A.sql - execution end\n";
    const SECONDARY: &str = "Number of invalids at start: 0\nNumber of invalids at end: 0\n";

    fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn good_zip() -> Vec<u8> {
        zip_bytes(&[
            ("FSMHO1U_oracle.log_completed.log", PRIMARY),
            ("FSMHO1U_invalids_completed.log", SECONDARY),
        ])
    }

    fn fixed_day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 8).unwrap()
    }

    struct Fixture {
        dir: tempfile::TempDir,
        watch: PathBuf,
        audit: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let watch = dir.path().join("incoming");
        let audit = dir.path().join("audit");
        std::fs::create_dir_all(&watch).unwrap();
        Fixture {
            watch,
            audit,
            dir,
        }
    }

    fn ingest(fx: &Fixture) -> IngestLoop {
        let mut clusters = BTreeMap::new();
        clusters.insert("mena".to_string(), vec!["FSMHO1U".to_string()]);
        let pipeline = Pipeline::new(
            Unwrapper::new(&clusters),
            Validator::new(["ORA-00001"]),
            &fx.audit,
        );
        IngestLoop::new(
            pipeline,
            FingerprintStore::in_memory(),
            DirectoryScanner::new(&fx.watch, "msg").with_settle_polls(false),
            Duration::from_millis(10),
        )
        .with_date_source(fixed_day)
    }

    #[test]
    fn test_processed_archive_is_recorded_once() {
        let fx = fixture();
        std::fs::write(fx.watch.join("pkg.zip"), good_zip()).unwrap();
        let mut ingest = ingest(&fx);

        let first = ingest.poll_once().unwrap();
        assert_eq!(first.processed, 1);
        assert!(ingest.store().seen("pkg.zip"));

        let second = ingest.poll_once().unwrap();
        assert_eq!(second, PollSummary::default());
        assert!(
            fx.audit
                .join("Mar_week10_2024/Processed/mena/FSMHO1U/pkg.zip")
                .exists()
        );
    }

    #[test]
    fn test_traversal_is_rejected_permanently() {
        let fx = fixture();
        let evil = zip_bytes(&[("../../evil.sh", "#!/bin/sh\n")]);
        std::fs::write(fx.watch.join("evil.zip"), evil).unwrap();
        let mut ingest = ingest(&fx);

        let summary = ingest.poll_once().unwrap();
        assert_eq!(summary.rejected, 1);
        assert!(ingest.store().seen("evil.zip"));
        assert_eq!(ingest.poll_once().unwrap(), PollSummary::default());
    }

    #[test]
    fn test_missing_log_is_retried() {
        let fx = fixture();
        let partial = zip_bytes(&[("FSMHO1U_oracle.log_completed.log", PRIMARY)]);
        std::fs::write(fx.watch.join("partial.zip"), partial).unwrap();
        let mut ingest = ingest(&fx);

        assert_eq!(ingest.poll_once().unwrap().failed, 1);
        assert!(!ingest.store().seen("partial.zip"));
        assert_eq!(ingest.poll_once().unwrap().failed, 1);
    }

    #[test]
    fn test_container_and_its_archives_are_recorded() {
        let fx = fixture();
        let zip = good_zip();
        build_msg(&fx.watch.join("mail.msg"), &[("FSMHO1U.zip", zip.as_slice())]);
        let mut ingest = ingest(&fx);

        let summary = ingest.poll_once().unwrap();
        assert_eq!(summary.processed, 1);
        assert!(ingest.store().seen("mail.msg"));
        assert!(ingest.store().seen("FSMHO1U.zip"));

        // The extracted zip is already recorded and is not processed again.
        assert_eq!(ingest.poll_once().unwrap(), PollSummary::default());
    }

    #[test]
    fn test_container_duplicate_of_watched_zip_is_archived_once() {
        for container_first in [true, false] {
            let fx = fixture();
            let zip = good_zip();
            std::fs::write(fx.watch.join("FSMHO1U.zip"), &zip).unwrap();
            let msg = fx.watch.join("mail.msg");
            build_msg(&msg, &[("FSMHO1U.zip", zip.as_slice())]);
            if container_first {
                let earlier = std::time::SystemTime::now() - Duration::from_secs(3600);
                std::fs::File::options()
                    .write(true)
                    .open(&msg)
                    .unwrap()
                    .set_modified(earlier)
                    .unwrap();
            }
            let mut ingest = ingest(&fx);

            let summary = ingest.poll_once().unwrap();

            assert_eq!(summary.failed, 0);
            assert!(ingest.store().seen("FSMHO1U.zip"));
            assert!(ingest.store().seen("mail.msg"));
            let destination = fx.audit.join("Mar_week10_2024/Processed/mena/FSMHO1U");
            let mut zips: Vec<String> = std::fs::read_dir(&destination)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|name| name.ends_with(".zip"))
                .collect();
            zips.sort();
            assert_eq!(zips, vec!["FSMHO1U.zip"], "container_first={container_first}");
            assert_eq!(ingest.poll_once().unwrap(), PollSummary::default());
        }
    }

    #[test]
    fn test_stop_is_honoured_before_each_file() {
        let fx = fixture();
        std::fs::write(fx.watch.join("a.zip"), good_zip()).unwrap();
        let stop = StopSignal::new();
        stop.stop();
        let mut ingest = ingest(&fx).with_stop(stop);

        assert_eq!(ingest.poll_once().unwrap(), PollSummary::default());
        assert!(!ingest.store().seen("a.zip"));
    }

    #[test]
    fn test_feed_and_status_report_runs() {
        let fx = fixture();
        std::fs::write(fx.watch.join("pkg.zip"), good_zip()).unwrap();
        let (feed, rx) = ActivityFeed::bounded(16);
        let status = StatusCell::new();
        let mut ingest = ingest(&fx).with_feed(feed).with_status(status.clone());

        ingest.poll_once().unwrap();

        let lines: Vec<String> = rx.try_iter().map(|l| l.message).collect();
        assert!(lines.iter().any(|l| l == "Processing pkg.zip"));
        assert!(lines.iter().any(|l| l.starts_with("PASS mena/FSMHO1U")));
        let snapshot = status.snapshot();
        assert_eq!(snapshot.state, MonitorState::Idle);
        assert_eq!(snapshot.processed, 1);
    }

    #[test]
    fn test_missing_watch_dir_is_scan_error() {
        let fx = fixture();
        std::fs::remove_dir(&fx.watch).unwrap();
        let mut ingest = ingest(&fx);
        assert!(matches!(ingest.poll_once(), Err(MonitorError::Scan { .. })));
    }

    #[test]
    fn test_spawned_monitor_stops_promptly() {
        let fx = fixture();
        let config = MonitorConfig::from_toml(&format!(
            r#"
            [monitor]
            watch_dir = "{}"
            base_archive_path = "{}"
            poll_interval_secs = 3600

            [clusters]
            mena = ["FSMHO1U"]
            "#,
            fx.watch.display(),
            fx.audit.display()
        ))
        .unwrap();

        let mut handle = spawn_monitor(&config).unwrap();
        let activity = handle.take_activity().unwrap();
        let first = activity.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(first.message.starts_with("Monitoring"));
        assert!(!handle.is_finished());

        handle.stop();
        assert!(handle.join());
    }

    #[test]
    fn test_from_config_opens_state_file() {
        let fx = fixture();
        let state = fx.dir.path().join("state.json");
        let mut store = FingerprintStore::open(&state).unwrap();
        store.record("old.zip", 1, Utc::now()).unwrap();

        let config = MonitorConfig::from_toml(&format!(
            r#"
            [monitor]
            watch_dir = "{}"
            base_archive_path = "{}"
            state_file = "{}"

            [clusters]
            mena = ["FSMHO1U"]
            "#,
            fx.watch.display(),
            fx.audit.display(),
            state.display()
        ))
        .unwrap();

        let ingest = IngestLoop::from_config(&config).unwrap();
        assert!(ingest.store().seen("old.zip"));
    }
}
