//! Worker threads: dequeue, execute with retry, record the outcome.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::coordination::{CancelReason, CancellationToken, start_watchdog};
use crate::domain::{ErrorKind, TaskConfig, TaskEvent, TaskId, TaskResult, TaskStatus};
use crate::error::Result;
use crate::scheduler::context::{TaskBody, TaskContext, TaskFailure};
use crate::scheduler::state::{Lifecycle, QueueState, Shared};

/// How one attempt ended
enum AttemptOutcome {
    Succeeded,
    Cancelled(String),
    Failed(TaskFailure),
}

/// Everything a worker needs to run a dequeued task outside the lock
struct Assignment {
    id: TaskId,
    body: Arc<dyn TaskBody>,
    config: Arc<TaskConfig>,
    token: CancellationToken,
}

pub(crate) fn spawn_workers(shared: &Arc<Shared>, count: usize, prefix: &str) -> std::io::Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|n| {
            let shared = Arc::clone(shared);
            thread::Builder::new()
                .name(format!("{}-{}", prefix, n))
                .spawn(move || worker_loop(shared))
        })
        .collect()
}

fn worker_loop(shared: Arc<Shared>) {
    tracing::debug!(worker = ?thread::current().name(), "Worker started");
    while let Some(assignment) = next_assignment(&shared) {
        shared.flush_events();
        let id = assignment.id.clone();
        if let Err(e) = run_task(&shared, assignment) {
            tracing::error!(task_id = %id, error = %e, "Task bookkeeping failed");
            release(&shared);
        }
        shared.flush_events();
    }
    tracing::debug!(worker = ?thread::current().name(), "Worker stopped");
}

/// Block until a task is available. None once the scheduler shut down and the queue is empty.
fn next_assignment(shared: &Shared) -> Option<Assignment> {
    let mut state = shared.lock_state();
    loop {
        if let Some(id) = state.queue.pop() {
            shared.bump_version();
            match prepare(&mut state, &id) {
                Ok(assignment) => {
                    state.in_flight += 1;
                    return Some(assignment);
                }
                Err(e) => {
                    tracing::error!(task_id = %id, error = %e, "Dropping unrunnable queue entry");
                    continue;
                }
            }
        }
        if state.lifecycle != Lifecycle::Accepting {
            return None;
        }
        state = shared.wait_for_work(state);
    }
}

fn prepare(state: &mut QueueState, id: &TaskId) -> Result<Assignment> {
    state.transition(id, TaskStatus::Running, None)?;
    let token = state.arm_token(id)?;
    let entry = state.entry(id)?;
    let config = entry.record.config().cloned().unwrap_or_default();
    Ok(Assignment {
        id: id.clone(),
        body: Arc::clone(&entry.body),
        config,
        token,
    })
}

/// Drive a RUNNING task through its attempts to a terminal status
fn run_task(shared: &Arc<Shared>, assignment: Assignment) -> Result<()> {
    let Assignment { id, body, config, mut token } = assignment;
    let policy = config
        .retry_policy()
        .cloned()
        .unwrap_or_else(|| shared.settings.retry.clone());
    let timeout = config.timeout().or(shared.settings.default_timeout);

    loop {
        if token.is_cancelled() {
            // Cancelled before this attempt could start (during backoff)
            return finish(shared, &id, TaskStatus::Cancelled, None);
        }

        let attempt = shared.lock_state().entry_mut(&id)?.record.begin_attempt();
        tracing::info!(task_id = %id, attempt, "Attempt started");

        let result = TaskResult::new(id.clone(), attempt);
        let (outcome, mut result) = execute_attempt(shared, &body, &config, &token, result, timeout);

        match outcome {
            AttemptOutcome::Succeeded => {
                result.finalize(TaskStatus::Completed)?;
                tracing::info!(task_id = %id, attempt, "Task completed");
                return finish(shared, &id, TaskStatus::Completed, Some(result));
            }
            AttemptOutcome::Cancelled(message) => {
                result.set_error(ErrorKind::Cancelled, message, None)?;
                result.finalize(TaskStatus::Cancelled)?;
                tracing::info!(task_id = %id, attempt, "Task cancelled");
                return finish(shared, &id, TaskStatus::Cancelled, Some(result));
            }
            AttemptOutcome::Failed(failure) => {
                result.set_error(failure.kind, failure.message.clone(), failure.trace.clone())?;
                result.finalize(TaskStatus::Failed)?;

                if !failure.retryable || !policy.should_retry(attempt) {
                    tracing::warn!(
                        task_id = %id,
                        attempt,
                        kind = %failure.kind,
                        error = %failure.message,
                        "Task failed"
                    );
                    return finish(shared, &id, TaskStatus::Failed, Some(result));
                }

                token = schedule_retry(shared, &id, attempt, result)?;
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    task_id = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure.message,
                    "Attempt failed, retrying"
                );
                shared.flush_events();
                token.wait_timeout(delay);
            }
        }
    }
}

/// Run the body once, enforcing the deadline and catching panics
fn execute_attempt(
    shared: &Arc<Shared>,
    body: &Arc<dyn TaskBody>,
    config: &Arc<TaskConfig>,
    token: &CancellationToken,
    result: TaskResult,
    timeout: Option<Duration>,
) -> (AttemptOutcome, TaskResult) {
    let mut ctx = TaskContext::new(Arc::clone(shared), Arc::clone(config), token.clone(), result);
    let label = ctx.task_id().to_string();

    let watchdog = timeout.and_then(|limit| match start_watchdog(token.clone(), limit, &label) {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(task_id = %label, error = %e, "Could not start watchdog, running without deadline");
            None
        }
    });

    let returned = panic::catch_unwind(AssertUnwindSafe(|| body.run(&mut ctx)));
    token.finish();
    if let Some(handle) = watchdog {
        let _ = handle.join();
    }

    let outcome = match returned {
        Ok(Ok(())) => AttemptOutcome::Succeeded,
        Ok(Err(failure)) => classify(failure, token.reason(), timeout),
        Err(payload) => {
            let failure = TaskFailure::new(panic_message(payload.as_ref())).with_kind(ErrorKind::Panic);
            classify(failure, token.reason(), timeout)
        }
    };
    (outcome, ctx.into_result())
}

/// Reinterpret a failure in light of why (and whether) the token was cancelled
fn classify(failure: TaskFailure, reason: Option<CancelReason>, timeout: Option<Duration>) -> AttemptOutcome {
    match reason {
        Some(CancelReason::Requested) => AttemptOutcome::Cancelled("cancelled by request".to_string()),
        Some(CancelReason::Shutdown) => AttemptOutcome::Cancelled("cancelled by shutdown".to_string()),
        Some(CancelReason::Timeout) => {
            let limit = timeout.map(|t| t.as_millis()).unwrap_or_default();
            AttemptOutcome::Failed(TaskFailure {
                kind: ErrorKind::Timeout,
                message: format!("attempt exceeded timeout of {}ms", limit),
                trace: failure.trace,
                retryable: true,
            })
        }
        None if failure.kind == ErrorKind::Cancelled => {
            AttemptOutcome::Cancelled(failure.message)
        }
        None => AttemptOutcome::Failed(failure),
    }
}

/// Store the failed attempt, announce the retry and arm the next attempt's token
fn schedule_retry(shared: &Shared, id: &TaskId, attempt: u32, result: TaskResult) -> Result<CancellationToken> {
    let mut state = shared.lock_state();
    let error = result.error().cloned();
    let entry = state.entry_mut(id)?;
    entry.record.push_result(result);
    let snapshot = entry.record.snapshot();
    let token = state.arm_token(id)?;
    if let Some(error) = error {
        state
            .outbox
            .push_back(TaskEvent::retrying(snapshot, attempt, error));
    }
    Ok(token)
}

/// Record the terminal status and wake waiters
fn finish(shared: &Shared, id: &TaskId, status: TaskStatus, result: Option<TaskResult>) -> Result<()> {
    let mut state = shared.lock_state();
    let entry = state.entry_mut(id)?;
    let attempt = entry.record.attempts();
    if let Some(result) = result {
        entry.record.push_result(result);
    }
    entry.token = None;
    if let Err(e) = state.transition(id, status, Some(attempt)) {
        tracing::error!(task_id = %id, to = %status, error = %e, "Terminal transition rejected");
    }
    state.in_flight = state.in_flight.saturating_sub(1);
    shared.settled.notify_all();
    Ok(())
}

/// Give back the in-flight slot after a bookkeeping error
fn release(shared: &Shared) {
    let mut state = shared.lock_state();
    state.in_flight = state.in_flight.saturating_sub(1);
    shared.settled.notify_all();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", message)
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_plain_failure() {
        let outcome = classify(TaskFailure::new("boom"), None, None);
        assert!(matches!(outcome, AttemptOutcome::Failed(f) if f.message == "boom"));
    }

    #[test]
    fn test_classify_requested_cancel() {
        let outcome = classify(TaskFailure::new("boom"), Some(CancelReason::Requested), None);
        assert!(matches!(outcome, AttemptOutcome::Cancelled(_)));
    }

    #[test]
    fn test_classify_timeout_is_retryable() {
        let outcome = classify(
            TaskFailure::cancelled(),
            Some(CancelReason::Timeout),
            Some(Duration::from_millis(50)),
        );
        match outcome {
            AttemptOutcome::Failed(failure) => {
                assert_eq!(failure.kind, ErrorKind::Timeout);
                assert!(failure.retryable);
                assert_eq!(failure.message, "attempt exceeded timeout of 50ms");
            }
            _ => panic!("expected timeout failure"),
        }
    }

    #[test]
    fn test_classify_self_reported_cancel() {
        let outcome = classify(TaskFailure::cancelled(), None, None);
        assert!(matches!(outcome, AttemptOutcome::Cancelled(_)));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("oops");
        assert_eq!(panic_message(payload.as_ref()), "task panicked: oops");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bad"));
        assert_eq!(panic_message(payload.as_ref()), "task panicked: bad");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "task panicked");
    }
}
