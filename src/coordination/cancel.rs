//! Cooperative cancellation for running attempts.
//!
//! Each attempt gets its own `CancellationToken`. The scheduler sets it on
//! user cancellation, non-draining shutdown, or when the attempt's watchdog
//! deadline elapses. Task bodies poll `is_cancelled` at safe points; once set,
//! the flag stays set for the rest of the attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Why an attempt was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel(task_id)` was called
    Requested,
    /// The execution deadline elapsed
    Timeout,
    /// Non-draining shutdown discarded in-flight work
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenState {
    Active,
    Cancelled(CancelReason),
    Finished,
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    state: Mutex<TokenState>,
    changed: Condvar,
}

/// Shared, atomically readable cancellation flag for one attempt
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(TokenState::Active),
                changed: Condvar::new(),
            }),
        }
    }

    /// Lock-free check for task bodies
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match *self.state() {
            TokenState::Cancelled(reason) => Some(reason),
            _ => None,
        }
    }

    /// Set the flag. Returns false if already cancelled or the attempt finished.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let mut state = self.state();
        if *state != TokenState::Active {
            return false;
        }
        *state = TokenState::Cancelled(reason);
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.changed.notify_all();
        true
    }

    /// Mark the attempt as done so a pending watchdog stands down
    pub fn finish(&self) {
        let mut state = self.state();
        if *state == TokenState::Active {
            *state = TokenState::Finished;
            self.inner.changed.notify_all();
        }
    }

    /// Sleep up to `timeout`, waking early on cancellation.
    ///
    /// Returns true if the token is cancelled when the wait ends.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| matches!(state, TokenState::Cancelled(_)));
        self.is_cancelled()
    }

    /// Wait until the token is cancelled or finished. Returns true if it settled in time.
    fn wait_settled(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state != TokenState::Active)
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(TokenState) -> bool) -> bool {
        // None: the timeout is too long to represent, wait without a deadline
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state();
        loop {
            if done(*state) {
                return true;
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match self.inner.changed.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => self
                    .inner
                    .changed
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }

    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancel `token` with `CancelReason::Timeout` unless the attempt settles within `timeout`.
pub fn start_watchdog(token: CancellationToken, timeout: Duration, label: &str) -> std::io::Result<JoinHandle<()>> {
    let label = label.to_string();
    thread::Builder::new()
        .name(format!("watchdog-{}", label))
        .spawn(move || {
            if !token.wait_settled(timeout) && token.cancel(CancelReason::Timeout) {
                tracing::warn!(task_id = %label, timeout_ms = timeout.as_millis() as u64, "Attempt deadline elapsed");
            }
        })
}
