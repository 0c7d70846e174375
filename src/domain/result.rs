//! Structured outcome of one task attempt.
//!
//! A `TaskResult` is created when a worker begins an attempt, collects metrics
//! and artifacts while the attempt runs, and is frozen by `finalize`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::task::{TaskId, TaskStatus};
use crate::error::{QueueError, Result};
use crate::id::generate_execution_id;

/// Where an artifact lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Remote,
}

/// Reference to an output produced by a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub storage: StorageKind,
    pub uri: String,
    /// Lowercase hex SHA-256 of the content
    pub checksum: String,
    pub size_bytes: Option<u64>,
    pub content_type: String,
}

impl ArtifactRef {
    /// Reference existing content by its precomputed checksum
    pub fn new(storage: StorageKind, uri: impl Into<String>, checksum: impl Into<String>) -> Result<Self> {
        let uri = uri.into().trim().to_string();
        if uri.is_empty() {
            return Err(QueueError::validation("uri", "artifact URI must not be empty"));
        }
        let checksum = checksum.into().to_ascii_lowercase();
        if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(QueueError::validation("checksum", "expected 64 hex characters (SHA-256)"));
        }
        Ok(Self {
            storage,
            uri,
            checksum,
            size_bytes: None,
            content_type: "application/octet-stream".to_string(),
        })
    }

    /// Reference content, computing its checksum and size
    pub fn from_data(data: &[u8], storage: StorageKind, uri: impl Into<String>) -> Result<Self> {
        if data.is_empty() {
            return Err(QueueError::validation("data", "artifact content must not be empty"));
        }
        let mut artifact = Self::new(storage, uri, sha256_hex(data))?;
        artifact.size_bytes = Some(data.len() as u64);
        Ok(artifact)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Check content against the recorded checksum
    pub fn verify(&self, data: &[u8]) -> bool {
        sha256_hex(data) == self.checksum
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Category of a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The task body reported a failure
    Execution,
    /// The attempt exceeded its deadline
    Timeout,
    /// The attempt was cancelled
    Cancelled,
    /// The task body panicked
    Panic,
    /// Bad input discovered at run time
    Validation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Panic => "panic",
            ErrorKind::Validation => "validation",
        };
        f.write_str(name)
    }
}

/// Failure detail attached to a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Option<String>,
}

/// A named instant recorded during an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub event: String,
    pub at: DateTime<Utc>,
}

/// Outcome of a single attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    task_id: TaskId,
    execution_id: String,
    attempt: u32,
    status: TaskStatus,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    timeline: Vec<TimelineEntry>,
    metrics: HashMap<String, f64>,
    artifacts: BTreeMap<String, ArtifactRef>,
    error: Option<ErrorDetail>,
    finalized: bool,
}

impl TaskResult {
    /// Start a result for the given attempt (1-based)
    pub fn new(task_id: TaskId, attempt: u32) -> Self {
        let execution_id = generate_execution_id(task_id.as_str(), attempt);
        Self {
            task_id,
            execution_id,
            attempt,
            status: TaskStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            timeline: Vec::new(),
            metrics: HashMap::new(),
            artifacts: BTreeMap::new(),
            error: None,
            finalized: false,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    pub fn metrics(&self) -> &HashMap<String, f64> {
        &self.metrics
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn artifacts(&self) -> &BTreeMap<String, ArtifactRef> {
        &self.artifacts
    }

    pub fn error(&self) -> Option<&ErrorDetail> {
        self.error.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Wall time of the attempt, once finalized
    pub fn duration(&self) -> Option<std::time::Duration> {
        self.completed_at
            .and_then(|done| (done - self.started_at).to_std().ok())
    }

    /// Record a numeric metric. Overwrites an earlier value with the same name.
    pub fn add_metric(&mut self, name: &str, value: f64) -> Result<()> {
        self.ensure_open("add metric")?;
        if name.trim().is_empty() {
            return Err(QueueError::validation("metric", "metric name must not be empty"));
        }
        if !value.is_finite() || value < 0.0 {
            return Err(QueueError::validation(
                name,
                format!("metric value must be a non-negative number, got {}", value),
            ));
        }
        self.metrics.insert(name.to_string(), value);
        Ok(())
    }

    /// Attach an output artifact under a unique name
    pub fn add_artifact(&mut self, name: &str, artifact: ArtifactRef) -> Result<()> {
        self.ensure_open("add artifact")?;
        if name.trim().is_empty() {
            return Err(QueueError::validation("artifact", "artifact name must not be empty"));
        }
        if self.artifacts.contains_key(name) {
            return Err(QueueError::InvalidState(format!("artifact '{}' already exists", name)));
        }
        self.artifacts.insert(name.to_string(), artifact);
        Ok(())
    }

    /// Record a named instant; each name may appear once
    pub fn record_timeline_event(&mut self, event: &str) -> Result<()> {
        self.ensure_open("record timeline event")?;
        if self.timeline.iter().any(|entry| entry.event == event) {
            return Err(QueueError::InvalidState(format!("timeline event '{}' already recorded", event)));
        }
        self.timeline.push(TimelineEntry {
            event: event.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Record failure detail. At most once per attempt.
    pub fn set_error(&mut self, kind: ErrorKind, message: impl Into<String>, trace: Option<String>) -> Result<()> {
        self.ensure_open("set error")?;
        if self.error.is_some() {
            return Err(QueueError::InvalidState(format!(
                "error already recorded for {}",
                self.execution_id
            )));
        }
        self.error = Some(ErrorDetail {
            kind,
            message: message.into(),
            trace,
        });
        Ok(())
    }

    /// Freeze the result with the attempt's terminal outcome
    pub fn finalize(&mut self, status: TaskStatus) -> Result<()> {
        self.ensure_open("finalize")?;
        if !status.is_terminal() {
            return Err(QueueError::InvalidState(format!(
                "cannot finalize {} with non-terminal status {}",
                self.execution_id, status
            )));
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.finalized = true;
        Ok(())
    }

    /// Compact JSON summary for audit logging
    pub fn to_audit_log(&self) -> serde_json::Value {
        serde_json::json!({
            "task_id": self.task_id,
            "execution_id": self.execution_id,
            "attempt": self.attempt,
            "status": self.status,
            "duration_ms": self.duration().map(|d| d.as_millis() as u64),
            "error": self.error,
            "artifacts_count": self.artifacts.len(),
            "metrics": self.metrics,
        })
    }

    fn ensure_open(&self, action: &str) -> Result<()> {
        if self.finalized {
            return Err(QueueError::InvalidState(format!(
                "cannot {} on finalized result {} ({})",
                action, self.execution_id, self.status
            )));
        }
        Ok(())
    }
}
