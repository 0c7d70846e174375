//! Domain types for taskqueue
//!
//! This module contains the core domain types:
//! - TaskRecord: the lifecycle entity with its status state machine
//! - TaskConfig: typed, validated parameter set
//! - TaskResult: metrics, artifacts and error detail of one attempt
//! - TaskEvent: payload relayed by the event bus

pub mod event;
pub mod result;
pub mod task;
pub mod task_config;

pub use event::{EventType, TaskEvent};
pub use result::{ArtifactRef, ErrorDetail, ErrorKind, StorageKind, TaskResult, TimelineEntry};
pub use task::{Priority, TaskId, TaskRecord, TaskSnapshot, TaskStatus};
pub use task_config::{Constraints, ParamDefinition, ParamType, ParamValue, TaskConfig, TaskConfigBuilder};
