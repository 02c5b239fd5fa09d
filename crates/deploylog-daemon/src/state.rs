//! Shared daemon state.
//!
//! Connects the signal handler to the monitor thread without sharing any
//! of the monitor's internals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use deploylog_core::monitor::{MonitorStatus, StatusCell, StopSignal};

/// Shared daemon state.
pub type SharedState = Arc<DaemonStateHandle>;

/// Handle to daemon state with interior mutability.
#[derive(Debug)]
pub struct DaemonStateHandle {
    /// Shutdown flag (atomic for lock-free checking).
    shutdown: AtomicBool,
    /// Stop signal observed by the monitor thread.
    stop: StopSignal,
    /// Status published by the monitor thread.
    status: StatusCell,
    /// Time when the daemon started.
    started_at: DateTime<Utc>,
}

impl DaemonStateHandle {
    /// Create a new daemon state handle.
    #[must_use]
    pub fn new(stop: StopSignal, status: StatusCell) -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            stop,
            status,
            started_at: Utc::now(),
        }
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown. The monitor finishes its current file first.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.stop.stop();
    }

    /// Current monitor status.
    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        self.status.snapshot()
    }

    /// Get daemon uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        let now = Utc::now();
        (now - self.started_at).num_seconds().max(0) as u64
    }
}
