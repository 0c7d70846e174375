//! Priority scheduler: the public face of the queue and its worker pool.
//!
//! The Scheduler:
//! 1. Validates and enqueues submissions in (priority, sequence) order
//! 2. Runs them on a fixed pool of worker threads
//! 3. Publishes lifecycle events through its event bus
//! 4. Answers status, result and position queries

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::Config;
use crate::coordination::{CancelReason, EventBus, SubscriptionId};
use crate::domain::{
    ErrorKind, EventType, Priority, TaskConfigBuilder, TaskEvent, TaskId, TaskRecord, TaskResult, TaskSnapshot,
    TaskStatus,
};
use crate::error::{QueueError, Result};
use crate::scheduler::context::{TaskBody, TaskContext, TaskFailure};
use crate::scheduler::position::{DEFAULT_FRESHNESS, QueuePosition, QueuePositionService};
use crate::scheduler::retry::RetryPolicy;
use crate::scheduler::state::{Lifecycle, Settings, Shared, TaskEntry};
use crate::scheduler::worker::spawn_workers;
use crate::storage::TaskStore;

/// A unit of work to submit: what to run, how urgently, and with which parameters
pub struct TaskSpec {
    title: String,
    description: String,
    priority: Priority,
    config: TaskConfigBuilder,
    body: Arc<dyn TaskBody>,
}

impl TaskSpec {
    pub fn new<F>(title: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut TaskContext) -> std::result::Result<(), TaskFailure> + Send + Sync + 'static,
    {
        Self::from_body(title, Arc::new(body))
    }

    /// Build from an existing `TaskBody` implementation
    pub fn from_body(title: impl Into<String>, body: Arc<dyn TaskBody>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            priority: Priority::default(),
            config: TaskConfigBuilder::new("default"),
            body,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Parameters, retry override and timeout; validated at submit
    pub fn config(mut self, config: TaskConfigBuilder) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("title", &self.title)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Point-in-time counts across the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub queued_by_priority: BTreeMap<Priority, usize>,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub workers: usize,
    pub accepting: bool,
}

/// Configures and starts a `Scheduler`
pub struct SchedulerBuilder {
    max_workers: usize,
    worker_name_prefix: String,
    retry: RetryPolicy,
    default_timeout: Option<Duration>,
    freshness: Duration,
    bus: Option<Arc<EventBus>>,
    store: Option<Arc<dyn TaskStore>>,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            max_workers: 2,
            worker_name_prefix: "taskqueue-worker".to_string(),
            retry: RetryPolicy::default(),
            default_timeout: None,
            freshness: DEFAULT_FRESHNESS,
            bus: None,
            store: None,
        }
    }
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder preloaded from the `scheduler`, `retry` and `positions` sections
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_workers: config.scheduler.max_workers,
            worker_name_prefix: config.scheduler.worker_name_prefix.clone(),
            retry: config.retry.clone(),
            default_timeout: config.scheduler.default_timeout(),
            freshness: config.positions.freshness(),
            ..Self::default()
        }
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn position_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Share an existing bus instead of creating one
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Mirror every published task snapshot into `store`
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate settings and start the worker pool
    pub fn build(self) -> Result<Scheduler> {
        if self.max_workers == 0 {
            return Err(QueueError::validation("max_workers", "must be at least 1"));
        }
        if self.default_timeout == Some(Duration::ZERO) {
            return Err(QueueError::validation("default_timeout", "must be greater than zero"));
        }
        self.retry.validate()?;

        let bus = self.bus.unwrap_or_else(|| Arc::new(EventBus::new()));
        let settings = Settings {
            retry: self.retry,
            default_timeout: self.default_timeout,
        };
        let shared = Arc::new(Shared::new(bus, self.store, settings));
        let workers = match spawn_workers(&shared, self.max_workers, &self.worker_name_prefix) {
            Ok(workers) => workers,
            Err(e) => {
                // Release any workers that did start
                shared.lock_state().lifecycle = Lifecycle::Stopped;
                shared.work_ready.notify_all();
                return Err(e.into());
            }
        };
        let positions = QueuePositionService::new(Arc::clone(&shared), self.freshness);

        tracing::info!(workers = self.max_workers, "Scheduler started");
        Ok(Scheduler {
            shared,
            positions,
            workers: Mutex::new(workers),
            worker_count: self.max_workers,
        })
    }
}

/// Thread-pool backed priority scheduler
pub struct Scheduler {
    shared: Arc<Shared>,
    positions: QueuePositionService,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_count)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Start a scheduler with default settings and `max_workers` threads
    pub fn new(max_workers: usize) -> Result<Self> {
        SchedulerBuilder::new().max_workers(max_workers).build()
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        SchedulerBuilder::from_config(config).build()
    }

    /// Validate and enqueue a task, returning immediately.
    ///
    /// The ENQUEUED event is handed to the dispatcher before this returns, but
    /// when another thread is already dispatching that thread delivers it, so
    /// handlers may not have run yet when `submit` returns.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId> {
        if spec.title.trim().is_empty() {
            return Err(QueueError::validation("title", "task title must not be empty"));
        }
        let config = Arc::new(spec.config.build()?);
        let mut record = TaskRecord::new(spec.title, spec.priority)
            .with_description(spec.description)
            .with_config(config);
        let id = record.id.clone();

        {
            let mut state = self.shared.lock_state();
            if state.lifecycle != Lifecycle::Accepting {
                return Err(QueueError::ShuttingDown);
            }

            let sequence = state.next_sequence;
            record.assign_sequence(sequence)?;
            state.next_sequence += 1;
            state.queue.push(id.clone(), record.priority, sequence);
            state.tasks.insert(
                id.clone(),
                TaskEntry {
                    record,
                    body: spec.body,
                    token: None,
                },
            );
            state.transition(&id, TaskStatus::Queued, None)?;
            self.shared.bump_version();
            self.shared.work_ready.notify_one();
            tracing::info!(task_id = %id, sequence, "Task submitted");
        }

        self.shared.flush_events();
        Ok(id)
    }

    /// Cancel a task.
    ///
    /// QUEUED tasks are removed and marked CANCELLED. RUNNING tasks have
    /// their cancellation flag set and stop cooperatively. Returns false for
    /// unknown or already terminal tasks.
    pub fn cancel(&self, id: &TaskId) -> bool {
        let cancelled = {
            let mut state = self.shared.lock_state();
            let Ok(entry) = state.entry_mut(id) else {
                return false;
            };
            match entry.record.status() {
                TaskStatus::Queued => {
                    entry.record.request_cancel();
                    state.queue.remove(id);
                    self.shared.bump_version();
                    let transitioned = state.transition(id, TaskStatus::Cancelled, None).is_ok();
                    self.shared.settled.notify_all();
                    transitioned
                }
                TaskStatus::Running => {
                    entry.record.request_cancel();
                    if let Some(token) = &entry.token {
                        token.cancel(CancelReason::Requested);
                    }
                    true
                }
                _ => false,
            }
        };

        if cancelled {
            tracing::info!(task_id = %id, "Cancellation requested");
            self.shared.flush_events();
        }
        cancelled
    }

    /// Stop accepting work and cancel everything still queued.
    ///
    /// With `drain`, blocks until in-flight tasks finish. Without it,
    /// in-flight tasks are asked to cancel and the call returns at once.
    pub fn shutdown(&self, drain: bool) {
        {
            let mut state = self.shared.lock_state();
            if state.lifecycle == Lifecycle::Accepting || (!drain && state.lifecycle == Lifecycle::Draining) {
                state.lifecycle = if drain { Lifecycle::Draining } else { Lifecycle::Stopped };

                let discarded = state.queue.drain();
                if !discarded.is_empty() {
                    self.shared.bump_version();
                }
                for id in &discarded {
                    if let Err(e) = state.transition(id, TaskStatus::Cancelled, None) {
                        tracing::error!(task_id = %id, error = %e, "Could not cancel queued task");
                    }
                }

                if !drain {
                    for entry in state.tasks.values() {
                        if let Some(token) = &entry.token {
                            token.cancel(CancelReason::Shutdown);
                        }
                    }
                }

                tracing::info!(drain, discarded = discarded.len(), "Scheduler shutting down");
                self.shared.work_ready.notify_all();
                self.shared.settled.notify_all();
            }
        }
        self.shared.flush_events();

        if drain {
            self.join_workers();
        }
    }

    fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let current = thread::current().id();
        for handle in handles {
            // A task body shutting down its own scheduler cannot join itself
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.lock_state().lifecycle == Lifecycle::Accepting
    }

    pub fn get_status(&self, id: &TaskId) -> Result<TaskStatus> {
        Ok(self.shared.lock_state().entry(id)?.record.status())
    }

    /// Latest finalized attempt result, if any attempt finished
    pub fn get_result(&self, id: &TaskId) -> Result<Option<TaskResult>> {
        Ok(self.shared.lock_state().entry(id)?.record.latest_result().cloned())
    }

    pub fn get_task(&self, id: &TaskId) -> Result<TaskSnapshot> {
        Ok(self.shared.lock_state().entry(id)?.record.snapshot())
    }

    /// Snapshots in submission order, optionally filtered by status
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskSnapshot> {
        let state = self.shared.lock_state();
        let mut tasks: Vec<TaskSnapshot> = state
            .tasks
            .values()
            .filter(|entry| status.is_none_or(|s| entry.record.status() == s))
            .map(|entry| entry.record.snapshot())
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Block until the task is terminal or `timeout` elapses.
    ///
    /// COMPLETED yields the final result; FAILED and CANCELLED map to
    /// `Execution`/`Timeout` and `Cancelled` errors.
    pub fn wait_for(&self, id: &TaskId, timeout: Duration) -> Result<TaskResult> {
        // None: wait until terminal however long it takes
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.lock_state();
        loop {
            let record = &state.entry(id)?.record;
            let status = record.status();
            if status.is_terminal() {
                return match status {
                    TaskStatus::Completed => record
                        .latest_result()
                        .cloned()
                        .ok_or_else(|| QueueError::InvalidState(format!("task {} completed without a result", id))),
                    TaskStatus::Cancelled => Err(QueueError::Cancelled(id.to_string())),
                    _ => Err(failure_error(id, record.latest_result())),
                };
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::Timeout(format!(
                            "task {} still {} after waiting {}ms",
                            id,
                            status,
                            timeout.as_millis()
                        )));
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            state = self.shared.wait_settled(state, remaining);
        }
    }

    /// Forget terminal tasks, returning how many were dropped
    pub fn purge_finished(&self) -> usize {
        let mut state = self.shared.lock_state();
        let before = state.tasks.len();
        state.tasks.retain(|_, entry| !entry.record.status().is_terminal());
        let purged = before - state.tasks.len();
        if purged > 0 {
            tracing::debug!(purged, "Purged finished tasks");
        }
        purged
    }

    pub fn queue_stats(&self) -> QueueStats {
        let state = self.shared.lock_state();
        let mut stats = QueueStats {
            queued: state.queue.len(),
            queued_by_priority: Priority::ALL
                .iter()
                .map(|&p| (p, state.queue.count_for(p)))
                .collect(),
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            workers: self.worker_count,
            accepting: state.lifecycle == Lifecycle::Accepting,
        };
        for entry in state.tasks.values() {
            match entry.record.status() {
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                TaskStatus::Pending | TaskStatus::Queued => {}
            }
        }
        stats
    }

    /// 1-based rank among queued tasks and the queue length
    pub fn get_position(&self, id: &TaskId) -> Result<QueuePosition> {
        self.positions.get_position(id)
    }

    pub fn positions(&self) -> &QueuePositionService {
        &self.positions
    }

    /// Register a handler for one event type.
    ///
    /// Handlers run outside the queue lock on whichever thread is dispatching
    /// at the time: a submitter, a worker or a caller of `cancel`/`shutdown`.
    /// Events for one task arrive in transition order, but possibly after the
    /// call that caused them has returned.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&TaskEvent) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(event_type, handler)
    }

    pub fn unsubscribe(&self, event_type: EventType, id: SubscriptionId) -> bool {
        self.shared.bus.unsubscribe(event_type, id)
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

fn failure_error(id: &TaskId, result: Option<&TaskResult>) -> QueueError {
    match result.and_then(TaskResult::error) {
        Some(error) if error.kind == ErrorKind::Timeout => QueueError::Timeout(error.message.clone()),
        Some(error) => QueueError::Execution {
            kind: error.kind,
            message: error.message.clone(),
        },
        None => QueueError::Execution {
            kind: ErrorKind::Execution,
            message: format!("task {} failed", id),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_zero_workers() {
        let result = Scheduler::builder().max_workers(0).build();
        assert!(matches!(result, Err(QueueError::Validation { param, .. }) if param == "max_workers"));
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = Scheduler::builder().default_timeout(Duration::ZERO).build();
        assert!(matches!(result, Err(QueueError::Validation { param, .. }) if param == "default_timeout"));
    }

    #[test]
    fn test_builder_rejects_invalid_retry() {
        let policy = RetryPolicy::new(1, Duration::from_secs(2), Duration::from_secs(1));
        let result = Scheduler::builder().retry_policy(policy).build();
        assert!(matches!(result, Err(QueueError::Validation { .. })));
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.scheduler.max_workers = 3;
        let scheduler = Scheduler::from_config(&config).unwrap();
        let stats = scheduler.queue_stats();
        assert_eq!(stats.workers, 3);
        assert!(stats.accepting);
        assert_eq!(scheduler.positions().freshness(), config.positions.freshness());
    }

    #[test]
    fn test_task_spec_defaults() {
        let spec = TaskSpec::new("t", |_ctx| Ok(()));
        assert_eq!(spec.priority, Priority::Normal);
        assert!(spec.description.is_empty());
        let spec = spec.priority(Priority::Low).description("later");
        assert_eq!(spec.priority, Priority::Low);
        assert_eq!(spec.description, "later");
    }

    #[test]
    fn test_shared_bus_is_used() {
        let bus = Arc::new(EventBus::new());
        let scheduler = Scheduler::builder().event_bus(Arc::clone(&bus)).build().unwrap();
        scheduler.subscribe(EventType::Completed, |_| Ok(()));
        assert_eq!(bus.subscriber_count(EventType::Completed), 1);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let scheduler = Scheduler::new(1).unwrap();
        scheduler.shutdown(true);
        scheduler.shutdown(true);
        scheduler.shutdown(false);
        assert!(!scheduler.is_accepting());
    }

    #[test]
    fn test_failure_error_mapping() {
        let id = TaskId::from("task_x");
        let mut result = TaskResult::new(id.clone(), 1);
        result.set_error(ErrorKind::Timeout, "too slow", None).unwrap();
        assert!(matches!(failure_error(&id, Some(&result)), QueueError::Timeout(m) if m == "too slow"));

        let mut result = TaskResult::new(id.clone(), 1);
        result.set_error(ErrorKind::Panic, "boom", None).unwrap();
        assert!(matches!(
            failure_error(&id, Some(&result)),
            QueueError::Execution { kind: ErrorKind::Panic, .. }
        ));

        assert!(matches!(
            failure_error(&id, None),
            QueueError::Execution { kind: ErrorKind::Execution, .. }
        ));
    }
}
