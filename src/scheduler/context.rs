//! The execution-side API handed to task bodies.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::coordination::CancellationToken;
use crate::domain::{ArtifactRef, ErrorKind, TaskConfig, TaskId, TaskResult};
use crate::error::{QueueError, Result};
use crate::scheduler::state::Shared;

/// Failure reported by a task body
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Option<String>,
    /// False skips any remaining retries
    pub retryable: bool,
}

impl TaskFailure {
    /// A retryable execution failure
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Execution,
            message: message.into(),
            trace: None,
            retryable: true,
        }
    }

    /// A failure that ends the task without further attempts
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(message)
        }
    }

    /// The body noticed cancellation and stopped early
    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: "cancelled".to_string(),
            trace: None,
            retryable: false,
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl From<QueueError> for TaskFailure {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Validation { .. } => TaskFailure::permanent(err.to_string()).with_kind(ErrorKind::Validation),
            QueueError::Cancelled(_) => TaskFailure::cancelled(),
            other => TaskFailure::new(other.to_string()),
        }
    }
}

impl From<eyre::Report> for TaskFailure {
    fn from(err: eyre::Report) -> Self {
        TaskFailure::new(format!("{:#}", err))
    }
}

/// Unit of work executed by the scheduler.
///
/// Implemented for any `Fn(&mut TaskContext) -> Result<(), TaskFailure>`.
pub trait TaskBody: Send + Sync {
    fn run(&self, ctx: &mut TaskContext) -> std::result::Result<(), TaskFailure>;
}

impl<F> TaskBody for F
where
    F: Fn(&mut TaskContext) -> std::result::Result<(), TaskFailure> + Send + Sync,
{
    fn run(&self, ctx: &mut TaskContext) -> std::result::Result<(), TaskFailure> {
        self(ctx)
    }
}

/// Per-attempt context: configuration, cancellation and result recording
pub struct TaskContext {
    shared: Arc<Shared>,
    task_id: TaskId,
    attempt: u32,
    config: Arc<TaskConfig>,
    token: CancellationToken,
    result: TaskResult,
}

impl TaskContext {
    pub(crate) fn new(shared: Arc<Shared>, config: Arc<TaskConfig>, token: CancellationToken, result: TaskResult) -> Self {
        Self {
            shared,
            task_id: result.task_id().clone(),
            attempt: result.attempt(),
            config,
            token,
            result,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(TaskFailure::cancelled())` once cancellation was requested
    pub fn check_cancelled(&self) -> std::result::Result<(), TaskFailure> {
        if self.token.is_cancelled() {
            return Err(TaskFailure::cancelled());
        }
        Ok(())
    }

    /// Sleep that wakes early, with a cancelled failure, when the attempt is cancelled
    pub fn sleep(&self, duration: Duration) -> std::result::Result<(), TaskFailure> {
        if self.token.wait_timeout(duration) {
            return Err(TaskFailure::cancelled());
        }
        Ok(())
    }

    pub fn add_metric(&mut self, name: &str, value: f64) -> Result<()> {
        self.result.add_metric(name, value)
    }

    pub fn add_artifact(&mut self, name: &str, artifact: ArtifactRef) -> Result<()> {
        self.result.add_artifact(name, artifact)
    }

    pub fn record_timeline_event(&mut self, event: &str) -> Result<()> {
        self.result.record_timeline_event(event)
    }

    /// The attempt's in-progress result
    pub fn result(&self) -> &TaskResult {
        &self.result
    }

    /// Publish a progress fraction, clamped to 0.0..=1.0
    pub fn report_progress(&self, progress: f64) {
        self.shared.report_progress(&self.task_id, self.attempt, progress);
    }

    pub(crate) fn into_result(self) -> TaskResult {
        self.result
    }
}
