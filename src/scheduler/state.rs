//! State shared between the scheduler facade, its workers and the position service.
//!
//! All queue mutations happen under one mutex. Lifecycle events are appended to
//! an outbox while that mutex is held and delivered afterwards by a single
//! dispatcher at a time, so per-task event order matches transition order and
//! handlers never run under the queue lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use crate::coordination::{CancelReason, CancellationToken, EventBus};
use crate::domain::{TaskEvent, TaskId, TaskRecord, TaskStatus};
use crate::error::{QueueError, Result};
use crate::scheduler::context::TaskBody;
use crate::scheduler::queue::PriorityQueue;
use crate::scheduler::retry::RetryPolicy;
use crate::storage::TaskStore;

/// Whether the scheduler still accepts and runs work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Accepting,
    /// Shut down; in-flight attempts run to completion
    Draining,
    /// Shut down; in-flight attempts were asked to cancel
    Stopped,
}

pub(crate) struct TaskEntry {
    pub(crate) record: TaskRecord,
    pub(crate) body: Arc<dyn TaskBody>,
    /// Token of the current (or next, during backoff) attempt
    pub(crate) token: Option<CancellationToken>,
}

pub(crate) struct QueueState {
    pub(crate) queue: PriorityQueue,
    pub(crate) tasks: HashMap<TaskId, TaskEntry>,
    pub(crate) next_sequence: u64,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) outbox: VecDeque<TaskEvent>,
    /// Tasks dequeued and not yet terminal
    pub(crate) in_flight: usize,
}

impl QueueState {
    fn new() -> Self {
        Self {
            queue: PriorityQueue::new(),
            tasks: HashMap::new(),
            next_sequence: 1,
            lifecycle: Lifecycle::Accepting,
            outbox: VecDeque::new(),
            in_flight: 0,
        }
    }

    pub(crate) fn entry(&self, id: &TaskId) -> Result<&TaskEntry> {
        self.tasks
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    pub(crate) fn entry_mut(&mut self, id: &TaskId) -> Result<&mut TaskEntry> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Apply a lifecycle transition and queue its event
    pub(crate) fn transition(&mut self, id: &TaskId, next: TaskStatus, attempt: Option<u32>) -> Result<()> {
        let entry = self.entry_mut(id)?;
        let old = entry.record.transition(next)?;

        let error = match next {
            TaskStatus::Failed => entry.record.latest_result().and_then(|r| r.error().cloned()),
            _ => None,
        };
        let mut event = TaskEvent::transition(entry.record.snapshot(), old).with_error(error);
        if let Some(attempt) = attempt {
            event = event.with_attempt(attempt);
        }

        tracing::debug!(task_id = %id, from = %old, to = %next, "Task transition");
        self.outbox.push_back(event);
        Ok(())
    }

    /// Register a fresh token for the task's next attempt.
    ///
    /// The token starts cancelled if cancellation was already requested or the
    /// scheduler stopped.
    pub(crate) fn arm_token(&mut self, id: &TaskId) -> Result<CancellationToken> {
        let stopped = self.lifecycle == Lifecycle::Stopped;
        let entry = self.entry_mut(id)?;
        let token = CancellationToken::new();
        if entry.record.cancel_requested() {
            token.cancel(CancelReason::Requested);
        } else if stopped {
            token.cancel(CancelReason::Shutdown);
        }
        entry.token = Some(token.clone());
        Ok(token)
    }
}

/// Scheduler-wide defaults applied to tasks without their own overrides
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) retry: RetryPolicy,
    pub(crate) default_timeout: Option<Duration>,
}

pub(crate) struct Shared {
    state: Mutex<QueueState>,
    /// Signalled when work is queued or the lifecycle changes
    pub(crate) work_ready: Condvar,
    /// Signalled whenever a task reaches a terminal status
    pub(crate) settled: Condvar,
    /// Bumped under the state lock whenever queue membership changes
    version: AtomicU64,
    pub(crate) bus: Arc<EventBus>,
    store: Option<Arc<dyn TaskStore>>,
    dispatching: Mutex<()>,
    pub(crate) settings: Settings,
}

impl Shared {
    pub(crate) fn new(bus: Arc<EventBus>, store: Option<Arc<dyn TaskStore>>, settings: Settings) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            work_ready: Condvar::new(),
            settled: Condvar::new(),
            version: AtomicU64::new(0),
            bus,
            store,
            dispatching: Mutex::new(()),
            settings,
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn wait_for_work<'a>(&self, guard: MutexGuard<'a, QueueState>) -> MutexGuard<'a, QueueState> {
        self.work_ready.wait(guard).unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for a terminal transition, for at most `timeout` when one is given
    pub(crate) fn wait_settled<'a>(
        &self,
        guard: MutexGuard<'a, QueueState>,
        timeout: Option<Duration>,
    ) -> MutexGuard<'a, QueueState> {
        match timeout {
            Some(timeout) => match self.settled.wait_timeout(guard, timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            },
            None => self.settled.wait(guard).unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    /// Current queue mutation version
    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Record a queue membership change. Call with the state lock held.
    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Update progress of a running task and publish it
    pub(crate) fn report_progress(&self, id: &TaskId, attempt: u32, progress: f64) {
        {
            let mut state = self.lock_state();
            let Ok(entry) = state.entry_mut(id) else {
                return;
            };
            if entry.record.status() != TaskStatus::Running {
                return;
            }
            let clamped = entry.record.set_progress(progress);
            let event = TaskEvent::progress(entry.record.snapshot(), attempt, clamped);
            state.outbox.push_back(event);
        }
        self.flush_events();
    }

    /// Deliver queued events. Returns immediately if another thread is dispatching;
    /// that thread picks up whatever was queued.
    pub(crate) fn flush_events(&self) {
        loop {
            let guard = match self.dispatching.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };

            loop {
                let batch: Vec<TaskEvent> = self.lock_state().outbox.drain(..).collect();
                if batch.is_empty() {
                    break;
                }
                for event in &batch {
                    self.bus.dispatch(event);
                    self.mirror(event);
                }
            }

            drop(guard);
            // An event queued between the last drain and the unlock would
            // otherwise wait for the next flush
            if self.lock_state().outbox.is_empty() {
                return;
            }
        }
    }

    fn mirror(&self, event: &TaskEvent) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&event.task) {
            tracing::warn!(task_id = %event.task.id, error = %e, "Failed to mirror task snapshot");
        }
    }
}
