//! In this module, we implement the monitoring side of capture: counters the
//! capture thread bumps as it goes, and the status snapshot handed out to
//! whoever asks.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::State;

/// Counters for one session, shared with the capture thread. These persist
/// across restarts.
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames: AtomicU64,
    idle_polls: AtomicU64,
    runs: AtomicU64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_frame(&self) -> u64 {
        self.frames.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record_idle(&self) {
        self.idle_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_run(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames captured over the lifetime of the session
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Polls that timed out without data
    pub fn idle_polls(&self) -> u64 {
        self.idle_polls.load(Ordering::Relaxed)
    }

    /// How many times the device was successfully opened
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: State,
    /// Samples per second, 0.0 while stalled or not running
    pub rate_hz: f64,
    pub frames: u64,
    pub idle_polls: u64,
    pub queue_len: usize,
    pub queue_dropped: u64,
    pub subscribers: usize,
    pub subscriber_failures: u64,
    pub subscriber_dropped: u64,
    /// Why the last capture run ended, if it ended badly
    pub last_error: Option<String>,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} | {:.1} Hz | frames: {} | queued: {} (dropped {}) | subscribers: {} (failures {}, dropped {})",
            self.state,
            self.rate_hz,
            self.frames,
            self.queue_len,
            self.queue_dropped,
            self.subscribers,
            self.subscriber_failures,
            self.subscriber_dropped,
        )?;
        if let Some(err) = &self.last_error {
            write!(f, " | last error: {}", err)?;
        }
        Ok(())
    }
}
