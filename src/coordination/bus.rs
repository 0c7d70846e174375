//! Synchronous publish/subscribe fabric for task lifecycle events.
//!
//! The bus is an explicit object owned by (or injected into) a scheduler.
//! Handlers run on the publishing thread, in registration order. A handler
//! that returns an error or panics is reported to the diagnostic log and
//! counted; other handlers and the publisher are unaffected.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::{EventType, TaskEvent};

/// Boxed event handler
pub type EventHandler = Arc<dyn Fn(&TaskEvent) -> eyre::Result<()> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: EventHandler,
}

/// Event bus with per-type subscriber lists
pub struct EventBus {
    subscribers: RwLock<HashMap<EventType, Vec<Subscription>>>,
    next_id: AtomicU64,
    handler_failures: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handler_failures", &self.handler_failures())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            handler_failures: AtomicU64::new(0),
        }
    }

    /// Register a handler for one event type
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&TaskEvent) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write()
            .entry(event_type)
            .or_default()
            .push(Subscription {
                id,
                handler: Arc::new(handler),
            });
        tracing::debug!(event_type = %event_type, subscription = id.0, "Handler subscribed");
        id
    }

    /// Remove a handler. Returns false if it was not registered for that type.
    pub fn unsubscribe(&self, event_type: EventType, id: SubscriptionId) -> bool {
        let mut subscribers = self.write();
        let Some(list) = subscribers.get_mut(&event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|subscription| subscription.id != id);
        before != list.len()
    }

    /// Invoke every handler registered for `event_type`.
    ///
    /// Returns the number of handlers that ran without failing.
    pub fn publish(&self, event_type: EventType, event: &TaskEvent) -> usize {
        // Snapshot the list so handlers may (un)subscribe re-entrantly
        let handlers: Vec<EventHandler> = match self.read().get(&event_type) {
            Some(list) => list.iter().map(|s| Arc::clone(&s.handler)).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => self.report_failure(event_type, event, &format!("{:#}", e)),
                Err(payload) => self.report_failure(event_type, event, &panic_message(payload.as_ref())),
            }
        }
        delivered
    }

    /// Deliver an event to its own type and, for transitions, to STATUS_CHANGED
    pub fn dispatch(&self, event: &TaskEvent) -> usize {
        let mut delivered = self.publish(event.event_type, event);
        if event.is_transition() && event.event_type != EventType::StatusChanged {
            delivered += self.publish(EventType::StatusChanged, event);
        }
        delivered
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.read().get(&event_type).map(Vec::len).unwrap_or(0)
    }

    /// Drop subscriptions for one type, or all of them
    pub fn clear(&self, event_type: Option<EventType>) {
        let mut subscribers = self.write();
        match event_type {
            Some(event_type) => {
                subscribers.remove(&event_type);
            }
            None => subscribers.clear(),
        }
    }

    /// Number of handler invocations that failed or panicked
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    fn report_failure(&self, event_type: EventType, event: &TaskEvent, message: &str) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            event_type = %event_type,
            task_id = %event.task.id,
            error = %message,
            "Event handler failed"
        );
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<EventType, Vec<Subscription>>> {
        self.subscribers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<EventType, Vec<Subscription>>> {
        self.subscribers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}
