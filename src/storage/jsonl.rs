//! JSONL-based task store with in-memory caching.
//!
//! Every save appends one line, so the file is an audit trail of task
//! states. On open the file is replayed and the last line per task wins.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::traits::TaskStore;
use crate::domain::{TaskId, TaskSnapshot};
use crate::error::{QueueError, Result};

/// Append-only JSON lines file of task snapshots
pub struct JsonlStore {
    path: PathBuf,
    cache: RwLock<HashMap<TaskId, TaskSnapshot>>,
}

impl std::fmt::Debug for JsonlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlStore").field("path", &self.path).finish_non_exhaustive()
    }
}

impl JsonlStore {
    /// Open (or create) the store file, replaying existing lines
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let cache = if path.exists() { Self::replay(&path)? } else { HashMap::new() };
        tracing::debug!(path = %path.display(), tasks = cache.len(), "Opened JSONL task store");

        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path) -> Result<HashMap<TaskId, TaskSnapshot>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let snapshot: TaskSnapshot = serde_json::from_str(&line)?;
            records.insert(snapshot.id.clone(), snapshot);
        }
        Ok(records)
    }

    /// Rewrite the file so it holds only the latest line per task
    pub fn compact(&self) -> Result<usize> {
        let cache = self.cache.write().map_err(|e| QueueError::Storage(e.to_string()))?;
        let mut snapshots: Vec<&TaskSnapshot> = cache.values().collect();
        snapshots.sort_by_key(|s| s.sequence);

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            for snapshot in &snapshots {
                writeln!(file, "{}", serde_json::to_string(snapshot)?)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(snapshots.len())
    }
}

impl TaskStore for JsonlStore {
    fn save(&self, snapshot: &TaskSnapshot) -> Result<()> {
        let line = serde_json::to_string(snapshot)?;

        // Hold the write lock across the append so lines land in cache order
        let mut cache = self.cache.write().map_err(|e| QueueError::Storage(e.to_string()))?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        cache.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    fn find_by_id(&self, id: &TaskId) -> Result<Option<TaskSnapshot>> {
        let cache = self.cache.read().map_err(|e| QueueError::Storage(e.to_string()))?;
        Ok(cache.get(id).cloned())
    }

    fn list_all(&self) -> Result<Vec<TaskSnapshot>> {
        let cache = self.cache.read().map_err(|e| QueueError::Storage(e.to_string()))?;
        let mut all: Vec<TaskSnapshot> = cache.values().cloned().collect();
        all.sort_by_key(|s| s.sequence);
        Ok(all)
    }
}
