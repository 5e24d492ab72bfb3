//! rowsync-core: data model, scope registry, configuration, and error taxonomy
//!
//! Everything here is provider-agnostic: the tracking store, batch manager,
//! and session engine all build on these types without knowing which storage
//! engine or transport sits underneath.

pub mod config;
pub mod error;
pub mod row;
pub mod scope;
pub mod stats;
pub mod value;
pub mod watermark;

pub use config::SyncOptions;
pub use error::{SyncError, SyncResult};
pub use row::{ChangeSet, RowChange, RowOp};
pub use scope::{
    ColumnDescriptor, ColumnKind, ConflictPolicy, ForeignKey, MergeFn, RowFilter, Scope,
    ScopeInfoClient, ScopeRegistry, TableDescriptor,
};
pub use stats::{ChangesApplied, ChangesSelected, ConflictCounts, FailedRow, SessionSummary};
pub use value::{RowKey, Value};
pub use watermark::{ReplicaId, Watermark};
