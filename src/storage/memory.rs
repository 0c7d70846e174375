//! In-memory task store.

use std::collections::HashMap;
use std::sync::RwLock;

use super::traits::TaskStore;
use crate::domain::{TaskId, TaskSnapshot};
use crate::error::{QueueError, Result};

/// Keeps the latest snapshot per task in a map
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<TaskId, TaskSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskStore for MemoryStore {
    fn save(&self, snapshot: &TaskSnapshot) -> Result<()> {
        let mut records = self.records.write().map_err(|e| QueueError::Storage(e.to_string()))?;
        records.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    fn find_by_id(&self, id: &TaskId) -> Result<Option<TaskSnapshot>> {
        let records = self.records.read().map_err(|e| QueueError::Storage(e.to_string()))?;
        Ok(records.get(id).cloned())
    }

    fn list_all(&self) -> Result<Vec<TaskSnapshot>> {
        let records = self.records.read().map_err(|e| QueueError::Storage(e.to_string()))?;
        let mut all: Vec<TaskSnapshot> = records.values().cloned().collect();
        all.sort_by_key(|s| s.sequence);
        Ok(all)
    }
}
