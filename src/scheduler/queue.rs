//! Ordered ready queue.
//!
//! Entries are keyed by `(priority, sequence)` so iteration order is exactly
//! dispatch order: strict priority across classes, FIFO within a class.
//! Sequence numbers are unique, so there are no unstable ties.

use std::collections::{BTreeMap, HashMap};

use crate::domain::{Priority, TaskId};

type QueueKey = (Priority, u64);

/// Priority queue with O(log n) removal by task id
#[derive(Debug, Default)]
pub struct PriorityQueue {
    entries: BTreeMap<QueueKey, TaskId>,
    index: HashMap<TaskId, QueueKey>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Insert a task. Returns false if it is already queued.
    pub fn push(&mut self, id: TaskId, priority: Priority, sequence: u64) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        let key = (priority, sequence);
        self.index.insert(id.clone(), key);
        self.entries.insert(key, id);
        true
    }

    /// Remove and return the minimum `(priority, sequence)` entry
    pub fn pop(&mut self) -> Option<TaskId> {
        let (_, id) = self.entries.pop_first()?;
        self.index.remove(&id);
        Some(id)
    }

    pub fn peek(&self) -> Option<&TaskId> {
        self.entries.values().next()
    }

    /// Remove a specific task. Returns false if it was not queued.
    pub fn remove(&mut self, id: &TaskId) -> bool {
        match self.index.remove(id) {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Queued ids in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = &TaskId> {
        self.entries.values()
    }

    /// Remove everything, returning ids in dispatch order
    pub fn drain(&mut self) -> Vec<TaskId> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Number of queued tasks of the given priority
    pub fn count_for(&self, priority: Priority) -> usize {
        self.entries
            .range((priority, 0)..=(priority, u64::MAX))
            .count()
    }
}
