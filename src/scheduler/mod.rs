//! Priority scheduling for taskqueue
//!
//! This module provides:
//! - Scheduler: submission, cancellation, shutdown and queries
//! - PriorityQueue: (priority, sequence) ordered ready queue
//! - RetryPolicy: capped exponential backoff between attempts
//! - QueuePositionService: cached rank lookups
//! - TaskBody/TaskContext: the execution-side API for task code

pub mod context;
pub mod manager;
pub mod position;
pub mod queue;
pub mod retry;
mod state;
mod worker;

pub use context::{TaskBody, TaskContext, TaskFailure};
pub use manager::{QueueStats, Scheduler, SchedulerBuilder, TaskSpec};
pub use position::{DEFAULT_FRESHNESS, QueuePosition, QueuePositionService};
pub use queue::PriorityQueue;
pub use retry::RetryPolicy;
