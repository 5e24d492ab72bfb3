//! rowsync-tracking: per-row change metadata, independent of business data.
//!
//! The `TrackingStore` and `StoreTx` traits are the engine's only view of a
//! storage backend. `MemoryStore` is the reference implementation; a real
//! database provider implements the same pair once per engine.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::{ApplyOutcome, ChangeCursor, StoreTx, TrackedRow, TrackingStore};
