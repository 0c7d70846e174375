//! ID generation utilities for taskqueue
//!
//! Provides functions for generating unique identifiers for tasks, attempts and events.

use uuid::Uuid;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a unique task ID
///
/// Format: `task_{32 hex chars}`
pub fn generate_task_id() -> String {
    format!("task_{}", Uuid::new_v4().simple())
}

/// Generate an execution ID for one attempt of a task
///
/// Format: `exec-{task_id}-{attempt}-{8 hex chars}`
pub fn generate_execution_id(task_id: &str, attempt: u32) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("exec-{}-{}-{}", task_id, attempt, &random[..8])
}

/// Generate an event ID
///
/// Format: `evt-{timestamp_ms}-{8 hex chars}`
pub fn generate_event_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("evt-{}-{}", now_ms(), &random[..8])
}
