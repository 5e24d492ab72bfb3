//! rowsync-engine: the synchronization protocol engine.
//!
//! # Overview
//! - `builder`: "changed since watermark" selection, dependency-ordered
//! - `conflict`: concurrent-edit detection and policy resolution
//! - `apply`: per-part application with partial-success semantics
//! - `messages`: the protocol request/response pairs
//! - `transport`: transport trait, retry/timeout wrapper, in-process loopback
//! - `responder`: the server half answering protocol requests
//! - `session`: the client half driving the session state machine
//! - `lock`: per-(scope, client) advisory session locks

pub mod apply;
pub mod builder;
pub mod conflict;
pub mod lock;
pub mod messages;
pub mod responder;
pub mod session;
pub mod transport;

pub use builder::ChangeSetBuilder;
pub use conflict::{Conflict, ConflictResolution, ConflictResolver, SyncSide};
pub use responder::SyncResponder;
pub use session::{SessionEvent, SessionReport, SessionState, SyncSession};
pub use transport::{LoopbackTransport, RetryingTransport, SyncTransport};
