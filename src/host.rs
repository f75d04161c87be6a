//! Host collaborators
//!
//! The backup core runs embedded in a host process that owns the user
//! interface and the process lifetime. The core only talks to it through the
//! traits in this module:
//!
//! - [`Notifier`] for toast notifications and progress
//! - [`Dialog`] for modal confirmation and selection
//! - [`Monitor`] for abort-aware sleeping in the service loop
//!
//! Simple implementations are included for headless use and tests.

use crate::types::ProgressInfo;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Minimum interval between forwarded progress updates
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Toast notification and progress surface
pub trait Notifier: Send + Sync {
    /// Show a short notification
    fn notify(&self, message: &str);

    /// Update a progress indicator
    fn progress(&self, _info: &ProgressInfo) {}
}

/// Modal dialog surface
pub trait Dialog: Send + Sync {
    /// Yes/no question; `true` means yes
    fn confirm(&self, heading: &str, message: &str) -> bool;

    /// Pick one of `options`; `None` when cancelled
    fn select(&self, heading: &str, options: &[String]) -> Option<usize>;

    /// Informational message
    fn ok(&self, heading: &str, message: &str);
}

/// Abort-aware sleep primitive
pub trait Monitor: Send + Sync {
    /// Whether the host asked the service to stop
    fn abort_requested(&self) -> bool;

    /// Sleep up to `timeout`; returns `true` as soon as abort is requested
    fn wait_for_abort(&self, timeout: Duration) -> bool;
}

/// Notifier that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        info!("Notification: {}", message);
    }
}

/// Dialog that gives the same answer to every question
///
/// Used for unattended runs where nobody can answer a prompt.
#[derive(Debug, Clone, Copy)]
pub struct FixedDialog {
    /// Answer to every confirmation
    pub answer: bool,
}

impl FixedDialog {
    /// Dialog that accepts everything
    pub fn accept() -> Self {
        Self { answer: true }
    }

    /// Dialog that declines everything
    pub fn decline() -> Self {
        Self { answer: false }
    }
}

impl Dialog for FixedDialog {
    fn confirm(&self, heading: &str, message: &str) -> bool {
        debug!("Auto-answering {:?} ({}) with {}", heading, message, self.answer);
        self.answer
    }

    fn select(&self, _heading: &str, options: &[String]) -> Option<usize> {
        if self.answer && !options.is_empty() {
            Some(0)
        } else {
            None
        }
    }

    fn ok(&self, heading: &str, message: &str) {
        info!("{}: {}", heading, message);
    }
}

/// Notifier that keeps every message, for inspection in tests
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
    progress: Mutex<Vec<ProgressInfo>>,
}

impl RecordingNotifier {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received so far
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    /// Progress updates received so far
    pub fn progress_updates(&self) -> Vec<ProgressInfo> {
        self.progress.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }

    fn progress(&self, info: &ProgressInfo) {
        self.progress.lock().push(info.clone());
    }
}

/// Abort flag with a condition variable so waiters wake immediately
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl AbortSignal {
    /// Create a signal that has not been raised
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiter
    pub fn request_abort(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock() = true;
        condvar.notify_all();
    }
}

impl Monitor for AbortSignal {
    fn abort_requested(&self) -> bool {
        *self.inner.0.lock()
    }

    fn wait_for_abort(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut aborted = flag.lock();
        while !*aborted {
            if condvar.wait_until(&mut aborted, deadline).timed_out() {
                break;
            }
        }
        *aborted
    }
}

/// Rate limiter for progress updates
///
/// The first update and any update describing a finished operation always
/// pass; others pass once `interval` has elapsed since the last one.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    /// Create a throttle with the given minimum interval
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Decide whether an update should be forwarded now
    pub fn should_emit(&mut self, info: &ProgressInfo) -> bool {
        self.should_emit_at(Instant::now(), info.is_complete())
    }

    /// Decide whether an update observed at `now` should be forwarded
    pub fn should_emit_at(&mut self, now: Instant, complete: bool) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(last) => complete || now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last_emit = Some(now);
        }
        due
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(PROGRESS_INTERVAL)
    }
}

/// Applies the notification settings before forwarding to a [`Notifier`]
#[derive(Clone)]
pub struct Notifications {
    notifier: Arc<dyn Notifier>,
    enabled: bool,
    detailed: bool,
}

impl Notifications {
    /// Wrap a notifier with the `show_notifications` and
    /// `detailed_notifications` switches
    pub fn new(notifier: Arc<dyn Notifier>, enabled: bool, detailed: bool) -> Self {
        Self {
            notifier,
            enabled,
            detailed,
        }
    }

    /// Send a notification; `detail` is appended only in detailed mode
    pub fn notify(&self, message: &str, detail: Option<&str>) {
        if !self.enabled {
            return;
        }
        match detail {
            Some(detail) if self.detailed && !detail.is_empty() => {
                self.notifier.notify(&format!("{} - {}", message, detail))
            }
            _ => self.notifier.notify(message),
        }
    }

    /// Forward a progress update regardless of the toast switch
    pub fn progress(&self, info: &ProgressInfo) {
        self.notifier.progress(info);
    }
}

impl std::fmt::Debug for Notifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifications")
            .field("enabled", &self.enabled)
            .field("detailed", &self.detailed)
            .finish()
    }
}
