//! In-memory tracking store with staged sub-transactions.
//!
//! Reference backend for tests and in-process replication. Writes are staged
//! on the transaction and applied atomically at commit, which is also where
//! watermarks are allocated: concurrent readers see either none or all of a
//! sub-transaction's effects.

use crate::store::{ApplyOutcome, ChangeCursor, StoreTx, TrackedRow, TrackingStore};
use async_trait::async_trait;
use rowsync_core::{
    ReplicaId, RowChange, RowKey, RowOp, ScopeInfoClient, SyncError, SyncResult, TableDescriptor,
    Value, Watermark,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

struct TableData {
    descriptor: TableDescriptor,
    rows: BTreeMap<RowKey, Vec<Value>>,
    tracking: BTreeMap<RowKey, TrackedRow>,
}

struct Inner {
    replica: ReplicaId,
    tables: HashMap<String, TableData>,
    scope_infos: HashMap<(String, ReplicaId), ScopeInfoClient>,
    high_watermark: Watermark,
}

impl Inner {
    fn table(&self, name: &str) -> SyncResult<&TableData> {
        self.tables
            .get(name)
            .ok_or_else(|| SyncError::SchemaMismatch(format!("table '{name}' is not tracked")))
    }

    fn table_mut(&mut self, name: &str) -> SyncResult<&mut TableData> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| SyncError::SchemaMismatch(format!("table '{name}' is not tracked")))
    }

    /// Minimum watermark of this store acknowledged by every registered
    /// peer. Infos owned by this replica record what the remote side has
    /// received from us; infos for other replicas record what those clients
    /// have received of ours.
    fn min_acknowledged(&self) -> Option<Watermark> {
        self.scope_infos
            .values()
            .map(|info| {
                if info.client_id == self.replica {
                    info.last_local_watermark_sent
                } else {
                    info.last_server_watermark_received
                }
            })
            .min()
    }
}

/// One staged mutation; applied in order at commit.
enum Staged {
    LocalPut {
        table: String,
        key: RowKey,
        values: Vec<Value>,
    },
    LocalDelete {
        table: String,
        key: RowKey,
    },
    Remote {
        change: RowChange,
        origin: ReplicaId,
    },
    ScopeInfo(ScopeInfoClient),
}

pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    replica: ReplicaId,
}

impl MemoryStore {
    pub fn new(replica: ReplicaId, tables: Vec<TableDescriptor>) -> Self {
        let tables = tables
            .into_iter()
            .map(|descriptor| {
                (
                    descriptor.name.clone(),
                    TableData {
                        descriptor,
                        rows: BTreeMap::new(),
                        tracking: BTreeMap::new(),
                    },
                )
            })
            .collect();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                replica,
                tables,
                scope_infos: HashMap::new(),
                high_watermark: Watermark::ZERO,
            })),
            replica,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned lock means a panicked writer; propagating the panic is
        // the only sound option for an in-memory store
        self.inner.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl TrackingStore for MemoryStore {
    fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    async fn begin(&self) -> SyncResult<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        }))
    }

    async fn table_names(&self) -> SyncResult<Vec<String>> {
        let inner = self.lock();
        let mut names: Vec<String> = inner.tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn high_watermark(&self) -> SyncResult<Watermark> {
        Ok(self.lock().high_watermark)
    }

    async fn query_changes(
        &self,
        table: &str,
        since: Watermark,
        exclude_origin: Option<ReplicaId>,
        cursor: Option<ChangeCursor>,
        limit: usize,
    ) -> SyncResult<Vec<TrackedRow>> {
        let inner = self.lock();
        let data = inner.table(table)?;

        let mut rows: Vec<TrackedRow> = data
            .tracking
            .values()
            .filter(|tr| tr.watermark > since)
            .filter(|tr| exclude_origin != Some(tr.origin))
            .filter(|tr| match &cursor {
                Some(c) => (tr.watermark, &tr.key) > (c.watermark, &c.key),
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.watermark, &a.key).cmp(&(b.watermark, &b.key)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn read_row(&self, table: &str, key: &RowKey) -> SyncResult<Option<Vec<Value>>> {
        let inner = self.lock();
        Ok(inner.table(table)?.rows.get(key).cloned())
    }

    async fn tracked(&self, table: &str, key: &RowKey) -> SyncResult<Option<TrackedRow>> {
        let inner = self.lock();
        Ok(inner.table(table)?.tracking.get(key).cloned())
    }

    async fn scope_info(
        &self,
        scope: &str,
        client: ReplicaId,
    ) -> SyncResult<Option<ScopeInfoClient>> {
        let inner = self.lock();
        Ok(inner.scope_infos.get(&(scope.to_string(), client)).cloned())
    }

    async fn scope_infos(&self) -> SyncResult<Vec<ScopeInfoClient>> {
        let inner = self.lock();
        let mut infos: Vec<ScopeInfoClient> = inner.scope_infos.values().cloned().collect();
        infos.sort_by(|a, b| (&a.scope_name, a.client_id).cmp(&(&b.scope_name, b.client_id)));
        Ok(infos)
    }

    async fn prune(&self, before: Watermark) -> SyncResult<usize> {
        let mut inner = self.lock();
        // Mandatory clamp: never drop a tombstone a registered peer has not
        // consumed. With no registered peers there is nobody lagging.
        let effective = match inner.min_acknowledged() {
            Some(acked) => before.min(acked),
            None => before,
        };

        let mut removed = 0;
        for data in inner.tables.values_mut() {
            let before_len = data.tracking.len();
            data.tracking.retain(|_, tr| tr.watermark >= effective);
            removed += before_len - data.tracking.len();
        }
        if removed > 0 {
            debug!(effective = %effective, removed, "pruned tracking metadata");
        }
        Ok(removed)
    }
}

pub struct MemoryTx {
    inner: Arc<Mutex<Inner>>,
    staged: Vec<Staged>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn put(&mut self, table: &str, values: Vec<Value>) -> SyncResult<()> {
        let key = {
            let inner = self.inner.lock().expect("memory store lock poisoned");
            let data = inner.table(table)?;
            data.descriptor
                .check_row(&values)
                .map_err(|reason| SyncError::Storage(format!("put into '{table}': {reason}")))?;
            data.descriptor
                .key_of(&values)
                .ok_or_else(|| SyncError::Storage(format!("put into '{table}': key extraction failed")))?
        };
        self.staged.push(Staged::LocalPut {
            table: table.to_string(),
            key,
            values,
        });
        Ok(())
    }

    async fn delete(&mut self, table: &str, key: RowKey) -> SyncResult<()> {
        {
            let inner = self.inner.lock().expect("memory store lock poisoned");
            inner.table(table)?;
        }
        self.staged.push(Staged::LocalDelete {
            table: table.to_string(),
            key,
        });
        Ok(())
    }

    async fn apply_row(
        &mut self,
        change: &RowChange,
        origin: ReplicaId,
    ) -> SyncResult<ApplyOutcome> {
        {
            let inner = self.inner.lock().expect("memory store lock poisoned");
            let data = inner.table(&change.table)?;

            // Idempotent replay: the same (origin, source watermark) or a
            // newer change from that origin is already committed.
            if let Some(tracked) = data.tracking.get(&change.key) {
                if tracked.origin == origin && change.source_watermark <= tracked.source_watermark {
                    debug!(
                        table = %change.table,
                        key = %change.key,
                        watermark = %change.source_watermark,
                        "replayed change, skipping"
                    );
                    return Ok(ApplyOutcome::Replayed);
                }
            }

            if change.op == RowOp::Upsert {
                data.descriptor
                    .check_row(&change.values)
                    .map_err(|reason| SyncError::ApplyFailure {
                        table: change.table.clone(),
                        key: change.key.clone(),
                        reason,
                    })?;
                let derived = data.descriptor.key_of(&change.values);
                if derived.as_ref() != Some(&change.key) {
                    return Err(SyncError::ApplyFailure {
                        table: change.table.clone(),
                        key: change.key.clone(),
                        reason: "key does not match row values".into(),
                    });
                }
            }
        }
        self.staged.push(Staged::Remote {
            change: change.clone(),
            origin,
        });
        Ok(ApplyOutcome::Applied)
    }

    async fn save_scope_info(&mut self, info: ScopeInfoClient) -> SyncResult<()> {
        self.staged.push(Staged::ScopeInfo(info));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> SyncResult<Watermark> {
        let MemoryTx { inner, staged } = *self;
        let mut inner = inner.lock().expect("memory store lock poisoned");
        let local = inner.replica;
        for op in staged {
            match op {
                Staged::LocalPut { table, key, values } => {
                    let watermark = inner.high_watermark.next();
                    inner.high_watermark = watermark;
                    let data = inner.table_mut(&table)?;
                    data.rows.insert(key.clone(), values);
                    data.tracking.insert(
                        key.clone(),
                        TrackedRow {
                            table,
                            key,
                            watermark,
                            origin: local,
                            source_watermark: watermark,
                            tombstone: false,
                        },
                    );
                }
                Staged::LocalDelete { table, key } => {
                    let watermark = inner.high_watermark.next();
                    inner.high_watermark = watermark;
                    let data = inner.table_mut(&table)?;
                    data.rows.remove(&key);
                    data.tracking.insert(
                        key.clone(),
                        TrackedRow {
                            table,
                            key,
                            watermark,
                            origin: local,
                            source_watermark: watermark,
                            tombstone: true,
                        },
                    );
                }
                Staged::Remote { change, origin } => {
                    let watermark = inner.high_watermark.next();
                    inner.high_watermark = watermark;
                    let data = inner.table_mut(&change.table)?;
                    let tombstone = change.op == RowOp::Delete;
                    if tombstone {
                        data.rows.remove(&change.key);
                    } else {
                        data.rows.insert(change.key.clone(), change.values.clone());
                    }
                    data.tracking.insert(
                        change.key.clone(),
                        TrackedRow {
                            table: change.table,
                            key: change.key,
                            watermark,
                            origin,
                            source_watermark: change.source_watermark,
                            tombstone,
                        },
                    );
                }
                Staged::ScopeInfo(info) => {
                    let entry = inner
                        .scope_infos
                        .entry((info.scope_name.clone(), info.client_id));
                    // watermarks only move forward across sessions
                    let merged = match entry {
                        std::collections::hash_map::Entry::Occupied(mut slot) => {
                            let existing = slot.get_mut();
                            existing.last_server_watermark_received = existing
                                .last_server_watermark_received
                                .max(info.last_server_watermark_received);
                            existing.last_local_watermark_sent = existing
                                .last_local_watermark_sent
                                .max(info.last_local_watermark_sent);
                            existing.clone()
                        }
                        std::collections::hash_map::Entry::Vacant(slot) => {
                            slot.insert(info).clone()
                        }
                    };
                    debug!(
                        scope = %merged.scope_name,
                        client = %merged.client_id,
                        received = %merged.last_server_watermark_received,
                        sent = %merged.last_local_watermark_sent,
                        "scope info committed"
                    );
                }
            }
        }
        Ok(inner.high_watermark)
    }

    async fn rollback(self: Box<Self>) -> SyncResult<()> {
        // staged writes are simply dropped
        Ok(())
    }
}
