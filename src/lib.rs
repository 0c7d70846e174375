//! Taskqueue - an in-process priority task scheduler
//!
//! Tasks are submitted with a priority and a validated configuration, run on
//! a fixed pool of worker threads in (priority, submission order), retried
//! with capped exponential backoff, and cancelled cooperatively. Lifecycle
//! transitions are published on a synchronous event bus, and callers can ask
//! where a queued task currently stands.

pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod id;
pub mod logging;
pub mod scheduler;
pub mod storage;

pub use config::Config;
pub use coordination::{CancelReason, CancellationToken, EventBus, SubscriptionId};
pub use domain::{
    ArtifactRef, ErrorKind, EventType, ParamDefinition, ParamType, ParamValue, Priority, StorageKind, TaskConfig,
    TaskConfigBuilder, TaskEvent, TaskId, TaskResult, TaskSnapshot, TaskStatus,
};
pub use error::{QueueError, Result};
pub use scheduler::{
    QueuePosition, QueueStats, RetryPolicy, Scheduler, SchedulerBuilder, TaskBody, TaskContext, TaskFailure, TaskSpec,
};
pub use storage::{JsonlStore, MemoryStore, TaskStore};
