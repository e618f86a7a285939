//! Run cancellation.
//!
//! A [`CancelToken`] is shared by every worker of a run. It trips when
//! [`CancelToken::cancel`] is called, when Ctrl+C is pressed (after
//! [`CancelToken::install_ctrlc_handler`]) or when the optional overall
//! deadline passes. Workers poll it between units of work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of cancellable sleeps and subprocess polling.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared cancellation flag with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Create a token that only trips when cancelled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token automatically once `limit` has elapsed.
    ///
    /// A limit too far in the future to represent means no deadline.
    pub fn with_deadline(mut self, limit: Duration) -> Self {
        self.deadline = Instant::now().checked_add(limit);
        self
    }

    /// Register a Ctrl+C handler that cancels this token.
    ///
    /// Only one handler can be installed per process; a second call fails
    /// and the token can still be cancelled manually.
    pub fn install_ctrlc_handler(&self) -> Result<(), ctrlc::Error> {
        let flag = self.flag.clone();
        ctrlc::set_handler(move || {
            log::warn!("interrupt received, cancelling run");
            flag.store(true, Ordering::SeqCst);
        })
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether the token was cancelled or its deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline_passed()
    }

    /// Whether cancellation came from [`CancelToken::cancel`] or Ctrl+C
    /// rather than the deadline.
    pub fn was_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `false` if the token tripped before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let end = Instant::now().checked_add(duration);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            let remaining = match end {
                Some(end) if now >= end => return true,
                Some(end) => end - now,
                None => POLL_INTERVAL,
            };
            thread::sleep(remaining.min(POLL_INTERVAL));
        }
    }
}
