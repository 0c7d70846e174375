//! Persistence seam for task snapshots.

use crate::domain::{TaskId, TaskSnapshot};
use crate::error::Result;

/// Write-behind mirror of task state.
///
/// The scheduler saves a snapshot after every published event and never
/// reads from the store while scheduling, so implementations only need to
/// keep the latest snapshot per task.
pub trait TaskStore: Send + Sync {
    /// Persist the latest state of a task, replacing any earlier one
    fn save(&self, snapshot: &TaskSnapshot) -> Result<()>;

    /// Latest saved state of a task
    fn find_by_id(&self, id: &TaskId) -> Result<Option<TaskSnapshot>>;

    /// Latest saved state of every task
    fn list_all(&self) -> Result<Vec<TaskSnapshot>>;
}
