//! Task record and lifecycle types
//!
//! A `TaskRecord` is the lifecycle entity the scheduler owns once a task is
//! submitted. Callers only ever see `TaskSnapshot` clones of it.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::result::TaskResult;
use crate::domain::task_config::TaskConfig;
use crate::error::{QueueError, Result};
use crate::id::generate_task_id;

/// Opaque, unique task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(generate_task_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Task priority. Lower numeric value = higher precedence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl Priority {
    /// All priorities, highest precedence first
    pub const ALL: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

    pub fn value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = QueueError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Priority::Critical),
            1 => Ok(Priority::High),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::Low),
            other => Err(QueueError::validation("priority", format!("unknown priority value {}", other))),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not yet enqueued
    Pending,
    /// Waiting in the priority queue
    Queued,
    /// Dequeued by a worker; retries stay here
    Running,
    /// An attempt succeeded
    Completed,
    /// Retries exhausted or a permanent failure
    Failed,
    /// Cancelled while queued or running
    Cancelled,
}

impl TaskStatus {
    /// Returns true if no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Whether `self -> next` is a legal lifecycle transition
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The lifecycle entity tracked by the scheduler
#[derive(Debug, Clone)]
pub struct TaskRecord {
    //=== Identity ===
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub priority: Priority,

    //=== Scheduling ===
    status: TaskStatus,
    /// Assigned once at first enqueue; sole tie-breaker within a priority
    sequence: Option<u64>,
    config: Option<Arc<TaskConfig>>,

    //=== Runtime State ===
    attempts: u32,
    progress: f64,
    cancel_requested: bool,
    /// One result per attempt; the last one is authoritative
    results: Vec<TaskResult>,

    //=== Timestamps ===
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a new PENDING record
    pub fn new(title: impl Into<String>, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            title: title.into(),
            description: String::new(),
            priority,
            status: TaskStatus::Pending,
            sequence: None,
            config: None,
            attempts: 0,
            progress: 0.0,
            cancel_requested: false,
            results: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_config(mut self, config: Arc<TaskConfig>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn config(&self) -> Option<&Arc<TaskConfig>> {
        self.config.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn results(&self) -> &[TaskResult] {
        &self.results
    }

    pub fn latest_result(&self) -> Option<&TaskResult> {
        self.results.last()
    }

    /// Assign the enqueue sequence number. Fails if one was already assigned.
    pub fn assign_sequence(&mut self, sequence: u64) -> Result<()> {
        if let Some(existing) = self.sequence {
            return Err(QueueError::InvalidState(format!(
                "task {} already has sequence number {}",
                self.id, existing
            )));
        }
        self.sequence = Some(sequence);
        Ok(())
    }

    /// Apply a lifecycle transition, returning the previous status.
    ///
    /// Illegal transitions fail without mutating the record.
    pub fn transition(&mut self, next: TaskStatus) -> Result<TaskStatus> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidState(format!(
                "task {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        let old = self.status;
        self.status = next;
        self.touch();
        if next == TaskStatus::Completed {
            self.progress = 1.0;
        }
        Ok(old)
    }

    /// Record the start of a new attempt, returning its 1-based number
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.touch();
        self.attempts
    }

    /// Store the finalized result of an attempt
    pub fn push_result(&mut self, result: TaskResult) {
        self.results.push(result);
        self.touch();
    }

    /// Clamp and store progress (0.0..=1.0)
    pub fn set_progress(&mut self, progress: f64) -> f64 {
        let clamped = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 1.0) };
        self.progress = clamped;
        self.touch();
        clamped
    }

    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
        self.touch();
    }

    /// Cheap, serializable view of this record
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            priority: self.priority,
            status: self.status,
            sequence: self.sequence,
            attempts: self.attempts,
            progress: self.progress,
            config_name: self.config.as_ref().map(|c| c.name().to_string()),
            result: self.results.last().cloned(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Read-only view of a task handed out to callers, events and stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub sequence: Option<u64>,
    pub attempts: u32,
    pub progress: f64,
    pub config_name: Option<String>,
    /// Latest attempt's result, if any
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
