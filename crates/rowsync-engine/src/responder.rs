//! The server half of the protocol: answers ensure-scope, serves outbound
//! batch parts from the spool, applies inbound client parts, and persists
//! client acks at end-of-session.
//!
//! The responder is transport-agnostic; `LoopbackTransport` calls it
//! directly, a network server would deserialize requests and do the same.

use crate::apply::apply_rows;
use crate::builder::ChangeSetBuilder;
use crate::conflict::{ConflictResolver, SyncSide};
use crate::messages::{
    EndSessionRequest, EndSessionResponse, EnsureScopeRequest, EnsureScopeResponse,
    GetChangesRequest, GetChangesResponse, SendChangesRequest, SendChangesResponse,
};
use rowsync_batch::{split, BatchSpool};
use rowsync_core::{
    ChangesSelected, ConflictCounts, ReplicaId, ScopeInfoClient, ScopeRegistry, SyncError,
    SyncOptions, SyncResult, Watermark,
};
use rowsync_tracking::TrackingStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The outbound batch currently spooled for one (scope, client) pair.
#[derive(Debug, Clone)]
struct OutboundBatch {
    batch_id: Uuid,
    /// Watermark the selection started from; a request with a different
    /// client watermark forces re-selection.
    since: Watermark,
    selected: ChangesSelected,
}

pub struct SyncResponder {
    store: Arc<dyn TrackingStore>,
    registry: Arc<ScopeRegistry>,
    options: SyncOptions,
    spool: BatchSpool,
    outbound: Mutex<HashMap<(String, ReplicaId), OutboundBatch>>,
}

impl SyncResponder {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        registry: Arc<ScopeRegistry>,
        options: SyncOptions,
    ) -> Arc<Self> {
        let spool = BatchSpool::new(Duration::from_secs(options.in_flight_ttl_secs));
        Arc::new(Self {
            store,
            registry,
            options,
            spool,
            outbound: Mutex::new(HashMap::new()),
        })
    }

    pub async fn ensure_scope(&self, req: EnsureScopeRequest) -> SyncResult<EnsureScopeResponse> {
        let scope = self.registry.checked(&req.scope_name)?;
        if scope.version != req.schema_version {
            return Err(SyncError::SchemaMismatch(format!(
                "scope '{}' is schema version {} on the server, client has {}",
                scope.name, scope.version, req.schema_version
            )));
        }
        let present = self.store.table_names().await?;
        for table in &scope.tables {
            if !present.iter().any(|t| t == &table.name) {
                return Err(SyncError::SchemaMismatch(format!(
                    "scoped table '{}' is absent from the server store",
                    table.name
                )));
            }
        }

        // first contact registers the client so tombstone pruning starts
        // waiting on it
        if self
            .store
            .scope_info(&req.scope_name, req.client_id)
            .await?
            .is_none()
        {
            let mut tx = self.store.begin().await?;
            tx.save_scope_info(ScopeInfoClient::new(&req.scope_name, req.client_id))
                .await?;
            tx.commit().await?;
            info!(scope = %req.scope_name, client = %req.client_id, "registered new client");
        }

        Ok(EnsureScopeResponse {
            schema: scope.clone(),
            policy: scope.policy,
            server_id: self.store.replica_id(),
            server_watermark: self.store.high_watermark().await?,
        })
    }

    /// Build and spool the outbound selection for one client, replacing any
    /// previous batch for the pair.
    async fn select_outbound(
        &self,
        scope_name: &str,
        client: ReplicaId,
        since: Watermark,
    ) -> SyncResult<OutboundBatch> {
        let scope = self.registry.checked(scope_name)?;
        let snapshot = self.store.high_watermark().await?;
        let change_set = ChangeSetBuilder::new(scope, self.store.as_ref())
            .build(since, Some(client))
            .await?;
        // the client commits up to here; rows above snapshot are covered by
        // the selection itself
        let watermark = snapshot.max(change_set.max_watermark());
        let selected = change_set.selected_stats();
        let parts = split(&change_set, self.options.max_part_size_bytes)?;
        let batch_id = self.spool.insert(parts, watermark)?;

        let entry = OutboundBatch {
            batch_id,
            since,
            selected,
        };
        let mut outbound = self.outbound.lock().expect("outbound map poisoned");
        if let Some(old) = outbound.insert((scope_name.to_string(), client), entry.clone()) {
            self.spool.remove(old.batch_id);
        }
        debug!(
            scope = scope_name,
            client = %client,
            since = %since,
            upserts = selected.upserts,
            deletes = selected.deletes,
            "selected outbound changes"
        );
        Ok(entry)
    }

    fn current_outbound(&self, scope_name: &str, client: ReplicaId) -> Option<OutboundBatch> {
        let outbound = self.outbound.lock().expect("outbound map poisoned");
        outbound.get(&(scope_name.to_string(), client)).cloned()
    }

    pub async fn get_changes(&self, req: GetChangesRequest) -> SyncResult<GetChangesResponse> {
        let existing = self.current_outbound(&req.scope_name, req.client_id);

        let entry = if req.batch_index_requested == 0 {
            // reuse a matching in-flight selection (e.g. retried request),
            // otherwise select afresh
            match existing {
                Some(e)
                    if e.since == req.client_watermark
                        && self.spool.part(e.batch_id, 0).is_ok() =>
                {
                    e
                }
                _ => {
                    self.select_outbound(&req.scope_name, req.client_id, req.client_watermark)
                        .await?
                }
            }
        } else {
            existing.ok_or(SyncError::IncompleteBatch {
                batch_id: Uuid::nil(),
                missing: vec![req.batch_index_requested],
            })?
        };

        let (part, server_watermark) = self.spool.part(entry.batch_id, req.batch_index_requested)?;
        Ok(GetChangesResponse {
            batch_index: part.part_index,
            batch_count: part.part_count,
            is_last_batch: part.is_last,
            part,
            server_watermark,
        })
    }

    pub async fn send_changes(&self, req: SendChangesRequest) -> SyncResult<SendChangesResponse> {
        let scope = self.registry.checked(&req.scope_name)?;
        let policy = scope.policy;
        let resolver = ConflictResolver::new(
            &scope.name,
            policy,
            self.registry.merge_handler(&scope.name),
        )?;

        if req.batch_index != req.part.part_index
            || req.batch_count != req.part.part_count
            || req.is_last_batch != req.part.is_last
        {
            return Err(SyncError::Payload(
                "batch metadata disagrees with the enclosed part".into(),
            ));
        }

        let rows = req.part.rows()?;
        let result = apply_rows(
            self.store.as_ref(),
            &rows,
            req.client_id,
            req.client_acked_server_watermark,
            &resolver,
            SyncSide::Client,
        )
        .await?;

        // track what this client has seen and sent, for prune bounds
        let mut info = self
            .store
            .scope_info(&req.scope_name, req.client_id)
            .await?
            .unwrap_or_else(|| ScopeInfoClient::new(&req.scope_name, req.client_id));
        info.last_server_watermark_received = info
            .last_server_watermark_received
            .max(req.client_acked_server_watermark);
        if let Some(max_sent) = rows.iter().map(|r| r.source_watermark).max() {
            info.last_local_watermark_sent = info.last_local_watermark_sent.max(max_sent);
        }
        let mut tx = self.store.begin().await?;
        tx.save_scope_info(info).await?;
        tx.commit().await?;

        let mut conflicts = ConflictCounts::default();
        for conflict in &result.conflicts {
            conflict.count_into(&mut conflicts);
        }

        // the last inbound part triggers outbound selection so the response
        // can carry the server's selected stats
        let server_selected = if req.is_last_batch {
            let entry = self
                .select_outbound(
                    &req.scope_name,
                    req.client_id,
                    req.client_acked_server_watermark,
                )
                .await?;
            Some(entry.selected)
        } else {
            None
        };

        Ok(SendChangesResponse {
            server_selected,
            client_applied: result.applied,
            conflicts,
            policy,
        })
    }

    pub async fn end_session(&self, req: EndSessionRequest) -> SyncResult<EndSessionResponse> {
        // persist the client's committed progress; the store keeps it
        // monotone
        let mut tx = self.store.begin().await?;
        tx.save_scope_info(req.scope_info.clone()).await?;
        tx.commit().await?;

        {
            let mut outbound = self.outbound.lock().expect("outbound map poisoned");
            if let Some(entry) = outbound.remove(&(req.scope_name.clone(), req.client_id)) {
                self.spool.remove(entry.batch_id);
            }
        }

        // best-effort prune, clamped by the store to the slowest client
        if self.options.cleanup_metadata {
            let high = self.store.high_watermark().await?;
            match self.store.prune(high).await {
                Ok(removed) => debug!(removed, "pruned server tracking metadata"),
                Err(e) => warn!(error = %e, "server metadata prune failed"),
            }
        }

        info!(
            scope = %req.scope_name,
            client = %req.client_id,
            applied = req.summary.applied_local.applied,
            "session ended"
        );
        Ok(EndSessionResponse {})
    }
}
