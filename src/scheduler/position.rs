//! Queue position lookups backed by a batch-computed snapshot.
//!
//! Computing one task's rank means walking the queue, so every refresh ranks
//! all queued tasks at once and caches the result. A cached snapshot serves
//! queries while both hold:
//! - the queue mutation version it was taken at is still current
//! - it is younger than the freshness window
//!
//! Cache hits never touch the queue lock: they load the atomic version and
//! take a shared read of the cache slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::domain::TaskId;
use crate::error::{QueueError, Result};
use crate::scheduler::state::Shared;

/// Default freshness window for cached positions
pub const DEFAULT_FRESHNESS: Duration = Duration::from_millis(200);

/// 1-based rank of a queued task and the queue length it was measured against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueuePosition {
    pub rank: usize,
    pub total: usize,
}

#[derive(Debug)]
struct QueueSnapshot {
    version: u64,
    captured_at: Instant,
    ranks: HashMap<TaskId, usize>,
    total: usize,
}

/// Cached rank lookups over the scheduler's queue
pub struct QueuePositionService {
    shared: Arc<Shared>,
    freshness: Duration,
    cache: RwLock<Option<Arc<QueueSnapshot>>>,
    recomputations: AtomicU64,
}

impl QueuePositionService {
    pub(crate) fn new(shared: Arc<Shared>, freshness: Duration) -> Self {
        Self {
            shared,
            freshness,
            cache: RwLock::new(None),
            recomputations: AtomicU64::new(0),
        }
    }

    /// Position of a QUEUED task. Not-found for unknown or no-longer-queued tasks.
    pub fn get_position(&self, id: &TaskId) -> Result<QueuePosition> {
        let snapshot = match self.fresh_snapshot() {
            Some(snapshot) => snapshot,
            None => self.refresh(),
        };
        snapshot
            .ranks
            .get(id)
            .map(|&rank| QueuePosition {
                rank,
                total: snapshot.total,
            })
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Drop the cached snapshot so the next query recomputes
    pub fn invalidate(&self) {
        *self.cache.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    pub fn is_cache_valid(&self) -> bool {
        self.fresh_snapshot().is_some()
    }

    /// How many batch recomputations have run
    pub fn recomputations(&self) -> u64 {
        self.recomputations.load(Ordering::Relaxed)
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    fn fresh_snapshot(&self) -> Option<Arc<QueueSnapshot>> {
        let version = self.shared.version();
        let cache = self.cache.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache
            .as_ref()
            .filter(|s| s.version == version && s.captured_at.elapsed() < self.freshness)
            .cloned()
    }

    /// Rank every queued task under the queue lock and publish the snapshot
    fn refresh(&self) -> Arc<QueueSnapshot> {
        let state = self.shared.lock_state();

        // Another caller may have refreshed while we waited for the lock
        if let Some(snapshot) = self.fresh_snapshot() {
            return snapshot;
        }

        let ranks: HashMap<TaskId, usize> = state
            .queue
            .iter()
            .enumerate()
            .map(|(index, id)| (id.clone(), index + 1))
            .collect();
        let snapshot = Arc::new(QueueSnapshot {
            version: self.shared.version(),
            captured_at: Instant::now(),
            total: ranks.len(),
            ranks,
        });

        *self.cache.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::clone(&snapshot));
        self.recomputations.fetch_add(1, Ordering::Relaxed);
        drop(state);

        tracing::debug!(total = snapshot.total, version = snapshot.version, "Queue positions recomputed");
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::EventBus;
    use crate::domain::Priority;
    use crate::scheduler::retry::RetryPolicy;
    use crate::scheduler::state::Settings;

    fn shared() -> Arc<Shared> {
        let settings = Settings {
            retry: RetryPolicy::default(),
            default_timeout: None,
        };
        Arc::new(Shared::new(Arc::new(EventBus::new()), None, settings))
    }

    fn enqueue(shared: &Shared, name: &str, priority: Priority) -> TaskId {
        let mut state = shared.lock_state();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let id = TaskId::from(name);
        state.queue.push(id.clone(), priority, sequence);
        shared.bump_version();
        id
    }

    #[test]
    fn test_ranks_follow_priority_then_sequence() {
        let shared = shared();
        let service = QueuePositionService::new(Arc::clone(&shared), Duration::from_secs(30));
        let low = enqueue(&shared, "low", Priority::Low);
        let first = enqueue(&shared, "first", Priority::High);
        let second = enqueue(&shared, "second", Priority::High);

        assert_eq!(service.get_position(&first).unwrap(), QueuePosition { rank: 1, total: 3 });
        assert_eq!(service.get_position(&second).unwrap(), QueuePosition { rank: 2, total: 3 });
        assert_eq!(service.get_position(&low).unwrap(), QueuePosition { rank: 3, total: 3 });
        assert_eq!(service.recomputations(), 1);
    }

    #[test]
    fn test_version_bump_invalidates() {
        let shared = shared();
        let service = QueuePositionService::new(Arc::clone(&shared), Duration::from_secs(30));
        let a = enqueue(&shared, "a", Priority::Normal);

        service.get_position(&a).unwrap();
        assert!(service.is_cache_valid());

        let b = enqueue(&shared, "b", Priority::Critical);
        assert!(!service.is_cache_valid());
        assert_eq!(service.get_position(&a).unwrap().rank, 2);
        assert_eq!(service.get_position(&b).unwrap().rank, 1);
        assert_eq!(service.recomputations(), 2);
    }

    #[test]
    fn test_zero_freshness_always_recomputes() {
        let shared = shared();
        let service = QueuePositionService::new(Arc::clone(&shared), Duration::ZERO);
        let a = enqueue(&shared, "a", Priority::Normal);

        service.get_position(&a).unwrap();
        service.get_position(&a).unwrap();
        assert_eq!(service.recomputations(), 2);
        assert!(!service.is_cache_valid());
    }

    #[test]
    fn test_invalidate_forces_refresh() {
        let shared = shared();
        let service = QueuePositionService::new(Arc::clone(&shared), DEFAULT_FRESHNESS);
        let a = enqueue(&shared, "a", Priority::Normal);

        service.get_position(&a).unwrap();
        service.invalidate();
        assert!(!service.is_cache_valid());
        service.get_position(&a).unwrap();
        assert_eq!(service.recomputations(), 2);
        assert_eq!(service.freshness(), DEFAULT_FRESHNESS);
    }

    #[test]
    fn test_unqueued_task_not_found() {
        let shared = shared();
        let service = QueuePositionService::new(Arc::clone(&shared), DEFAULT_FRESHNESS);
        let result = service.get_position(&TaskId::from("task_missing"));
        assert!(matches!(result, Err(QueueError::NotFound(_))));
    }
}
