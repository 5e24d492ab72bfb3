//! Storage capability traits.
//!
//! The engine depends on exactly this surface: record/query change metadata,
//! apply rows, and scope transactions. Implementations supply the physical
//! engine underneath (the in-memory backend here, SQL providers elsewhere).

use async_trait::async_trait;
use rowsync_core::{ReplicaId, RowChange, RowKey, ScopeInfoClient, SyncResult, Value, Watermark};
use serde::{Deserialize, Serialize};

/// Per-row change metadata, kept separately from business data.
///
/// `watermark` is always in this store's own domain and orders the row
/// against every other local mutation. `source_watermark` is the watermark
/// the change carried on the replica that produced it; for local edits the
/// two coincide. A tombstone survives until every registered peer has
/// acknowledged at least its watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRow {
    pub table: String,
    pub key: RowKey,
    pub watermark: Watermark,
    pub origin: ReplicaId,
    pub source_watermark: Watermark,
    pub tombstone: bool,
}

/// Restart position for a change query: resumes strictly after
/// `(watermark, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCursor {
    pub watermark: Watermark,
    pub key: RowKey,
}

impl ChangeCursor {
    pub fn after(row: &TrackedRow) -> Self {
        Self {
            watermark: row.watermark,
            key: row.key.clone(),
        }
    }
}

/// Result of applying one remote row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change was staged for commit.
    Applied,
    /// The same change (or a newer one from the same origin) is already
    /// committed; replay is a no-op.
    Replayed,
}

/// Read side of a tracking store. All methods see committed state only.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Identity of this store's replica.
    fn replica_id(&self) -> ReplicaId;

    /// Open a sub-transaction. Writes are invisible until `commit`.
    async fn begin(&self) -> SyncResult<Box<dyn StoreTx>>;

    async fn table_names(&self) -> SyncResult<Vec<String>>;

    /// Highest watermark of any committed mutation.
    async fn high_watermark(&self) -> SyncResult<Watermark>;

    /// Tracked rows of `table` with watermark strictly greater than `since`,
    /// ascending by `(watermark, key)`. Rows whose current version
    /// originated from `exclude_origin` are suppressed so a peer is never
    /// sent its own changes back. Restartable via `cursor`; at most `limit`
    /// rows are returned.
    async fn query_changes(
        &self,
        table: &str,
        since: Watermark,
        exclude_origin: Option<ReplicaId>,
        cursor: Option<ChangeCursor>,
        limit: usize,
    ) -> SyncResult<Vec<TrackedRow>>;

    /// Current business values of a live row, in table column order.
    async fn read_row(&self, table: &str, key: &RowKey) -> SyncResult<Option<Vec<Value>>>;

    /// Change metadata for one key, tombstones included.
    async fn tracked(&self, table: &str, key: &RowKey) -> SyncResult<Option<TrackedRow>>;

    async fn scope_info(&self, scope: &str, client: ReplicaId)
        -> SyncResult<Option<ScopeInfoClient>>;

    /// Every persisted scope-info row, across scopes and clients.
    async fn scope_infos(&self) -> SyncResult<Vec<ScopeInfoClient>>;

    /// Remove tracking entries with watermark strictly below `before`,
    /// clamped to the minimum watermark acknowledged by all registered
    /// peers. The clamp is mandatory: dropping a tombstone a lagging peer
    /// has not consumed loses the delete silently. Returns entries removed.
    async fn prune(&self, before: Watermark) -> SyncResult<usize>;
}

/// Write side: one sub-transaction. Every committed mutation allocates a
/// fresh watermark and records its `TrackedRow` in the same commit, so
/// tracking metadata can never drift from the data it describes.
#[async_trait]
pub trait StoreTx: Send {
    /// Local upsert; the key is derived from the table's primary key.
    async fn put(&mut self, table: &str, values: Vec<Value>) -> SyncResult<()>;

    /// Local delete; records a tombstone even when the row is absent.
    async fn delete(&mut self, table: &str, key: RowKey) -> SyncResult<()>;

    /// Apply one remote change on behalf of `origin`. Constraint violations
    /// surface as `ApplyFailure`; replays short-circuit to `Replayed`.
    async fn apply_row(&mut self, change: &RowChange, origin: ReplicaId)
        -> SyncResult<ApplyOutcome>;

    /// Persist scope progress; watermarks are clamped monotone.
    async fn save_scope_info(&mut self, info: ScopeInfoClient) -> SyncResult<()>;

    /// Atomically commit all staged writes; returns the new high watermark.
    async fn commit(self: Box<Self>) -> SyncResult<Watermark>;

    /// Discard all staged writes.
    async fn rollback(self: Box<Self>) -> SyncResult<()>;
}
