//! Coordination primitives shared by the scheduler and task bodies
//!
//! - `EventBus`: synchronous lifecycle notifications
//! - `CancellationToken`: per-attempt cooperative cancellation and deadlines

pub mod bus;
pub mod cancel;

pub use bus::{EventBus, EventHandler, SubscriptionId};
pub use cancel::{CancelReason, CancellationToken, start_watchdog};
