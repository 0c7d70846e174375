//! Lifecycle events relayed through the event bus.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::result::ErrorDetail;
use crate::domain::task::{TaskSnapshot, TaskStatus};
use crate::id::generate_event_id;

/// Kinds of events a handler can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// PENDING -> QUEUED
    Enqueued,
    /// QUEUED -> RUNNING
    Started,
    /// An attempt failed and another one is scheduled
    Retrying,
    /// Progress reported by a running task body
    Progress,
    /// RUNNING -> COMPLETED
    Completed,
    /// RUNNING -> FAILED
    Failed,
    /// QUEUED/RUNNING -> CANCELLED
    Cancelled,
    /// Any lifecycle transition
    StatusChanged,
}

impl EventType {
    /// Lifecycle event published for a transition into `status`
    pub fn for_status(status: TaskStatus) -> Option<EventType> {
        match status {
            TaskStatus::Pending => None,
            TaskStatus::Queued => Some(EventType::Enqueued),
            TaskStatus::Running => Some(EventType::Started),
            TaskStatus::Completed => Some(EventType::Completed),
            TaskStatus::Failed => Some(EventType::Failed),
            TaskStatus::Cancelled => Some(EventType::Cancelled),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Enqueued => "task.enqueued",
            EventType::Started => "task.started",
            EventType::Retrying => "task.retrying",
            EventType::Progress => "task.progress",
            EventType::Completed => "task.completed",
            EventType::Failed => "task.failed",
            EventType::Cancelled => "task.cancelled",
            EventType::StatusChanged => "task.status_changed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload delivered to event handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Unique event identifier
    pub id: String,
    pub event_type: EventType,
    /// The task as it was right after the event
    pub task: TaskSnapshot,
    /// Set for lifecycle transitions
    pub old_status: Option<TaskStatus>,
    pub new_status: Option<TaskStatus>,
    /// Attempt number, for attempt-scoped events
    pub attempt: Option<u32>,
    /// Failure detail for RETRYING and FAILED
    pub error: Option<ErrorDetail>,
    /// Progress fraction for PROGRESS
    pub progress: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    fn new(event_type: EventType, task: TaskSnapshot) -> Self {
        Self {
            id: generate_event_id(),
            event_type,
            task,
            old_status: None,
            new_status: None,
            attempt: None,
            error: None,
            progress: None,
            timestamp: Utc::now(),
        }
    }

    /// A lifecycle transition `old -> task.status`
    pub fn transition(task: TaskSnapshot, old_status: TaskStatus) -> Self {
        let new_status = task.status;
        let event_type = EventType::for_status(new_status).unwrap_or(EventType::StatusChanged);
        let mut event = Self::new(event_type, task);
        event.old_status = Some(old_status);
        event.new_status = Some(new_status);
        event
    }

    /// A failed attempt that will be retried
    pub fn retrying(task: TaskSnapshot, attempt: u32, error: ErrorDetail) -> Self {
        let mut event = Self::new(EventType::Retrying, task);
        event.attempt = Some(attempt);
        event.error = Some(error);
        event
    }

    /// Progress reported by a running body
    pub fn progress(task: TaskSnapshot, attempt: u32, progress: f64) -> Self {
        let mut event = Self::new(EventType::Progress, task);
        event.attempt = Some(attempt);
        event.progress = Some(progress);
        event
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_error(mut self, error: Option<ErrorDetail>) -> Self {
        self.error = error;
        self
    }

    /// Whether STATUS_CHANGED subscribers also receive this event
    pub fn is_transition(&self) -> bool {
        self.new_status.is_some()
    }
}
