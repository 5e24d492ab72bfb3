//! Change-set selection: everything changed since a watermark, emitted in an
//! order a receiver can apply without ever violating referential integrity.
//!
//! Upserts walk the scope's FK graph parents-first; deletes are collected
//! and appended last in reverse dependency order, so a child delete always
//! precedes its parent's.

use rowsync_core::{ChangeSet, ReplicaId, RowChange, Scope, SyncError, SyncResult, Watermark};
use rowsync_tracking::{ChangeCursor, TrackedRow, TrackingStore};
use tracing::debug;

/// Tracked rows are paged out of the store in chunks of this many, exercising
/// the restartable cursor instead of materializing whole tables.
const QUERY_PAGE: usize = 512;

pub struct ChangeSetBuilder<'a> {
    scope: &'a Scope,
    store: &'a dyn TrackingStore,
}

impl<'a> ChangeSetBuilder<'a> {
    pub fn new(scope: &'a Scope, store: &'a dyn TrackingStore) -> Self {
        Self { scope, store }
    }

    /// Select every change with watermark above `since`, skipping rows whose
    /// current version originated from `exclude_origin`.
    pub async fn build(
        &self,
        since: Watermark,
        exclude_origin: Option<ReplicaId>,
    ) -> SyncResult<ChangeSet> {
        let present = self.store.table_names().await?;
        for table in &self.scope.tables {
            if !present.iter().any(|t| t == &table.name) {
                return Err(SyncError::SchemaMismatch(format!(
                    "scoped table '{}' is absent from the store",
                    table.name
                )));
            }
        }

        let order = self.scope.dependency_order()?;
        let mut upserts: Vec<RowChange> = Vec::new();
        // deletes per table, emitted after all upserts in reverse order
        let mut deletes: Vec<Vec<RowChange>> = Vec::with_capacity(order.len());

        for table in order {
            let mut table_deletes = Vec::new();
            for tracked in self.scan(&table.name, since, exclude_origin).await? {
                if tracked.tombstone {
                    table_deletes.push(RowChange::delete(
                        tracked.table.clone(),
                        tracked.key,
                        tracked.watermark,
                    ));
                    continue;
                }
                match self.store.read_row(&tracked.table, &tracked.key).await? {
                    Some(values) => {
                        if let Some(filter) = &table.filter {
                            if !filter.matches(table, &values) {
                                continue;
                            }
                        }
                        upserts.push(RowChange::upsert(
                            tracked.table.clone(),
                            tracked.key,
                            values,
                            tracked.watermark,
                        ));
                    }
                    // tracked as live but the row vanished: treat as deleted
                    None => table_deletes.push(RowChange::delete(
                        tracked.table.clone(),
                        tracked.key,
                        tracked.watermark,
                    )),
                }
            }
            deletes.push(table_deletes);
        }

        let mut rows = upserts;
        for table_deletes in deletes.into_iter().rev() {
            rows.extend(table_deletes);
        }

        debug!(
            scope = %self.scope.name,
            since = %since,
            rows = rows.len(),
            "built change set"
        );
        Ok(ChangeSet::new(self.scope.name.clone(), rows))
    }

    /// Page through one table's changes via the restartable cursor.
    async fn scan(
        &self,
        table: &str,
        since: Watermark,
        exclude_origin: Option<ReplicaId>,
    ) -> SyncResult<Vec<TrackedRow>> {
        let mut all = Vec::new();
        let mut cursor: Option<ChangeCursor> = None;
        loop {
            let page = self
                .store
                .query_changes(table, since, exclude_origin, cursor.clone(), QUERY_PAGE)
                .await?;
            let done = page.len() < QUERY_PAGE;
            if let Some(last) = page.last() {
                cursor = Some(ChangeCursor::after(last));
            }
            all.extend(page);
            if done {
                break;
            }
        }
        Ok(all)
    }
}
