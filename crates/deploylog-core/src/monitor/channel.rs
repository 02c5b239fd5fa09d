//! Presentation boundary.
//!
//! The worker never shares mutable state with whatever renders its
//! progress. It publishes through three handles:
//!
//! - [`ActivityFeed`]: bounded queue of timestamped log lines. Sending never
//!   blocks; lines that do not fit are dropped and counted.
//! - [`StatusCell`]: the current [`MonitorState`] plus the last verdict.
//! - [`StopSignal`]: cooperative cancellation that also wakes the poll
//!   sleep.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::validate::VerdictStatus;

/// Severity of an activity line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivityLevel {
    /// Progress.
    Info,
    /// Recoverable problem.
    Warn,
    /// Failed run.
    Error,
}

impl fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

/// One line of the activity feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityLine {
    /// When the line was produced.
    pub at: DateTime<Utc>,
    /// Severity.
    pub level: ActivityLevel,
    /// Text.
    pub message: String,
}

impl fmt::Display for ActivityLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<5} {}",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// Producer side of the activity feed.
#[derive(Debug, Clone)]
pub struct ActivityFeed {
    tx: SyncSender<ActivityLine>,
    dropped: Arc<AtomicU64>,
}

impl ActivityFeed {
    /// Create a feed holding at most `capacity` undelivered lines.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, Receiver<ActivityLine>) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Publish a line without blocking.
    pub fn push(&self, level: ActivityLevel, message: impl Into<String>) {
        let line = ActivityLine {
            at: Utc::now(),
            level,
            message: message.into(),
        };
        match self.tx.try_send(line) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {},
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            },
        }
    }

    /// Publish an info line.
    pub fn info(&self, message: impl Into<String>) {
        self.push(ActivityLevel::Info, message);
    }

    /// Publish a warning line.
    pub fn warn(&self, message: impl Into<String>) {
        self.push(ActivityLevel::Warn, message);
    }

    /// Publish an error line.
    pub fn error(&self, message: impl Into<String>) {
        self.push(ActivityLevel::Error, message);
    }

    /// Lines dropped because the feed was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// What the worker is doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MonitorState {
    /// Not running.
    Stopped,
    /// Waiting for the next poll.
    Idle,
    /// Running the pipeline for a file.
    Processing {
        /// Filename.
        file: String,
    },
}

/// Last completed verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastVerdict {
    /// Input filename.
    pub file: String,
    /// Verdict status.
    pub status: VerdictStatus,
    /// Verdict summary.
    pub summary: String,
    /// Completion time.
    pub at: DateTime<Utc>,
}

/// Snapshot of a [`StatusCell`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorStatus {
    /// Current state.
    pub state: MonitorState,
    /// Most recent verdict, if any.
    pub last_verdict: Option<LastVerdict>,
    /// Files that completed the pipeline.
    pub processed: u64,
    /// Files whose run failed.
    pub failed: u64,
}

impl Default for MonitorStatus {
    fn default() -> Self {
        Self {
            state: MonitorState::Stopped,
            last_verdict: None,
            processed: 0,
            failed: 0,
        }
    }
}

/// Shared current-status slot.
#[derive(Debug, Clone, Default)]
pub struct StatusCell {
    inner: Arc<Mutex<MonitorStatus>>,
}

impl StatusCell {
    /// Create a cell in the `Stopped` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut MonitorStatus)) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard);
    }

    /// Copy of the current status.
    #[must_use]
    pub fn snapshot(&self) -> MonitorStatus {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current state.
    pub fn set_state(&self, state: MonitorState) {
        self.update(|s| s.state = state);
    }

    /// Record a completed run.
    pub fn record_verdict(&self, verdict: LastVerdict) {
        self.update(|s| {
            s.processed += 1;
            s.last_verdict = Some(verdict);
        });
    }

    /// Record a failed run.
    pub fn record_failure(&self) {
        self.update(|s| s.failed += 1);
    }
}

/// Cooperative stop request.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    /// Create an unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake any waiter.
    pub fn stop(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`, returning early on a stop request.
    ///
    /// Returns whether a stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}
