//! Storage layer for taskqueue
//!
//! The scheduler mirrors task snapshots into a `TaskStore` after each event.
//! Two implementations ship with the crate: `MemoryStore` and the append-only
//! `JsonlStore`.

mod jsonl;
mod memory;
mod traits;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;
pub use traits::TaskStore;
