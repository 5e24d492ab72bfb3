//! The client half: a single-threaded session pipeline driving
//! EnsureScope through CleanupMetadata for one (scope, client) pair.
//!
//! CommitWatermarks is the sole durability boundary. Every earlier failure
//! rolls back only the in-flight sub-transaction; batch parts already
//! committed stay committed, and the next session resumes from the last
//! acknowledged watermark with idempotent replay covering any overlap.

use crate::apply::apply_rows;
use crate::builder::ChangeSetBuilder;
use crate::conflict::{Conflict, ConflictResolver, SyncSide};
use crate::lock::SessionLockRegistry;
use crate::messages::{EndSessionRequest, EnsureScopeRequest, GetChangesRequest, SendChangesRequest};
use crate::transport::SyncTransport;
use rowsync_batch::split;
use rowsync_core::{
    ScopeInfoClient, ScopeRegistry, SessionSummary, SyncError, SyncOptions, SyncResult,
};
use rowsync_tracking::TrackingStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session states, in pipeline order. `Failed` is terminal but
/// non-corrupting and reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    EnsureScope,
    EnsureSchema,
    SelectChanges,
    TransferBatches,
    ApplyChanges,
    ResolveConflicts,
    CommitWatermarks,
    CleanupMetadata,
    Completed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Immutable snapshot emitted at each state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub state: SessionState,
    pub summary: SessionSummary,
}

pub type EventFn = Box<dyn Fn(&SessionEvent) + Send + Sync>;

/// What a completed session hands back: the summary plus every conflict,
/// resolved or not, as a structured list.
#[derive(Debug)]
pub struct SessionReport {
    pub summary: SessionSummary,
    pub conflicts: Vec<Conflict>,
}

pub struct SyncSession {
    scope_name: String,
    store: Arc<dyn TrackingStore>,
    registry: Arc<ScopeRegistry>,
    transport: Arc<dyn SyncTransport>,
    options: SyncOptions,
    locks: Arc<SessionLockRegistry>,
    cancel: CancellationToken,
    on_event: Option<EventFn>,
}

impl SyncSession {
    pub fn new(
        scope_name: impl Into<String>,
        store: Arc<dyn TrackingStore>,
        registry: Arc<ScopeRegistry>,
        transport: Arc<dyn SyncTransport>,
        options: SyncOptions,
        locks: Arc<SessionLockRegistry>,
    ) -> Self {
        Self {
            scope_name: scope_name.into(),
            store,
            registry,
            transport,
            options,
            locks,
            cancel: CancellationToken::new(),
            on_event: None,
        }
    }

    /// Cancel the session from outside; observed between states and between
    /// batch-part round-trips.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn on_event(mut self, callback: EventFn) -> Self {
        self.on_event = Some(callback);
        self
    }

    fn emit(&self, state: SessionState, summary: &SessionSummary) {
        debug!(scope = %self.scope_name, state = %state, "session state");
        if let Some(callback) = &self.on_event {
            callback(&SessionEvent {
                state,
                summary: summary.clone(),
            });
        }
    }

    fn ensure_not_cancelled(&self, state: SessionState) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled(state.to_string()));
        }
        Ok(())
    }

    /// Enter a state: cancellation checkpoint, then event.
    fn enter(&self, state: SessionState, summary: &SessionSummary) -> SyncResult<()> {
        self.ensure_not_cancelled(state)?;
        self.emit(state, summary);
        Ok(())
    }

    /// Run the session to completion. On failure the terminal error is
    /// returned and a `Failed` event carries the partial summary.
    pub async fn run(&self) -> SyncResult<SessionReport> {
        let mut summary = SessionSummary::new(&self.scope_name);
        match self.drive(&mut summary).await {
            Ok(conflicts) => {
                self.emit(SessionState::Completed, &summary);
                Ok(SessionReport { summary, conflicts })
            }
            Err(error) => {
                warn!(scope = %self.scope_name, error = %error, "session failed");
                self.emit(SessionState::Failed, &summary);
                Err(error)
            }
        }
    }

    async fn drive(&self, summary: &mut SessionSummary) -> SyncResult<Vec<Conflict>> {
        let client = self.store.replica_id();

        // ── EnsureScope ──────────────────────────────────────────────────
        self.enter(SessionState::EnsureScope, summary)?;
        let _lock = self.locks.try_acquire(&self.scope_name, client)?;
        let local_scope = self.registry.checked(&self.scope_name)?.clone();

        let ensure = self
            .transport
            .ensure_scope(EnsureScopeRequest {
                scope_name: self.scope_name.clone(),
                client_id: client,
                schema_version: local_scope.version,
            })
            .await?;
        if ensure.schema.version != local_scope.version {
            return Err(SyncError::SchemaMismatch(format!(
                "server schema version {} differs from local {}",
                ensure.schema.version, local_scope.version
            )));
        }
        // the server's policy is authoritative; a merge policy without a
        // local handler must surface before any transfer
        let resolver = ConflictResolver::new(
            &self.scope_name,
            ensure.policy,
            self.registry.merge_handler(&self.scope_name),
        )?;
        let server_id = ensure.server_id;
        let mut progress = self
            .store
            .scope_info(&self.scope_name, client)
            .await?
            .unwrap_or_else(|| ScopeInfoClient::new(&self.scope_name, client));

        // ── EnsureSchema ─────────────────────────────────────────────────
        self.enter(SessionState::EnsureSchema, summary)?;
        let present = self.store.table_names().await?;
        for table in &local_scope.tables {
            if !present.iter().any(|t| t == &table.name) {
                return Err(SyncError::SchemaMismatch(format!(
                    "scoped table '{}' is absent from the local store",
                    table.name
                )));
            }
        }

        // ── SelectChanges ────────────────────────────────────────────────
        self.enter(SessionState::SelectChanges, summary)?;
        let snapshot = self.store.high_watermark().await?;
        let change_set = ChangeSetBuilder::new(&local_scope, self.store.as_ref())
            .build(progress.last_local_watermark_sent, Some(server_id))
            .await?;
        let sent_watermark = snapshot.max(change_set.max_watermark());
        summary.client_selected = change_set.selected_stats();

        // ── TransferBatches: upload our changes part by part ─────────────
        self.enter(SessionState::TransferBatches, summary)?;
        let parts = split(&change_set, self.options.max_part_size_bytes)?;
        for part in parts {
            self.ensure_not_cancelled(SessionState::TransferBatches)?;
            let response = self
                .transport
                .send_changes(SendChangesRequest {
                    scope_name: self.scope_name.clone(),
                    client_id: client,
                    client_acked_server_watermark: progress.last_server_watermark_received,
                    batch_index: part.part_index,
                    batch_count: part.part_count,
                    is_last_batch: part.is_last,
                    part,
                })
                .await?;
            summary.applied_remote.merge(&response.client_applied);
            summary.conflicts.merge(&response.conflicts);
            if let Some(selected) = response.server_selected {
                summary.server_selected = selected;
            }
        }

        // ── TransferBatches/ApplyChanges: download and apply in order ────
        self.enter(SessionState::ApplyChanges, summary)?;
        let mut conflicts: Vec<Conflict> = Vec::new();
        let mut server_watermark = progress.last_server_watermark_received;
        let mut index = 0u32;
        let mut selection_restarts = 0u32;
        loop {
            self.ensure_not_cancelled(SessionState::ApplyChanges)?;
            let response = match self
                .transport
                .get_changes(GetChangesRequest {
                    scope_name: self.scope_name.clone(),
                    client_id: client,
                    client_watermark: progress.last_server_watermark_received,
                    batch_index_requested: index,
                })
                .await
            {
                Ok(response) => response,
                // the server no longer holds the in-flight batch; restart
                // selection from part zero, replay makes the overlap a no-op
                Err(SyncError::IncompleteBatch { .. })
                    if selection_restarts < self.options.max_transfer_retries =>
                {
                    selection_restarts += 1;
                    warn!(
                        scope = %self.scope_name,
                        restart = selection_restarts,
                        "in-flight batch lost, restarting selection"
                    );
                    index = 0;
                    continue;
                }
                Err(error) => return Err(error),
            };

            // parts are applied strictly in index order: later parts may
            // reference parents inserted only by earlier ones
            if response.batch_index != index || response.part.part_index != index {
                return Err(SyncError::Payload(format!(
                    "server returned part {} for requested index {index}",
                    response.batch_index
                )));
            }

            let rows = response.part.rows()?;
            // each part applies in its own sub-transaction; the sender had
            // received everything we uploaded this session
            let result = apply_rows(
                self.store.as_ref(),
                &rows,
                server_id,
                sent_watermark,
                &resolver,
                SyncSide::Server,
            )
            .await?;
            summary.applied_local.merge(&result.applied);
            for conflict in &result.conflicts {
                conflict.count_into(&mut summary.conflicts);
            }
            conflicts.extend(result.conflicts);
            summary.failed_rows.extend(result.failed);

            server_watermark = response.server_watermark;
            if response.is_last_batch {
                break;
            }
            index = response.batch_index + 1;
        }

        // ── ResolveConflicts: the structured list is complete here ───────
        self.enter(SessionState::ResolveConflicts, summary)?;

        // ── CommitWatermarks: the only durability boundary ───────────────
        self.enter(SessionState::CommitWatermarks, summary)?;
        progress.last_server_watermark_received = progress
            .last_server_watermark_received
            .max(server_watermark);
        progress.last_local_watermark_sent =
            progress.last_local_watermark_sent.max(sent_watermark);
        let mut tx = self.store.begin().await?;
        tx.save_scope_info(progress.clone()).await?;
        tx.commit().await?;
        info!(
            scope = %self.scope_name,
            received = %progress.last_server_watermark_received,
            sent = %progress.last_local_watermark_sent,
            "watermarks committed"
        );

        // the session is durable; a lost end-session note only delays
        // server-side pruning
        if let Err(error) = self
            .transport
            .end_session(EndSessionRequest {
                scope_name: self.scope_name.clone(),
                client_id: client,
                scope_info: progress.clone(),
                summary: summary.clone(),
            })
            .await
        {
            warn!(scope = %self.scope_name, error = %error, "end-session notification failed");
        }

        // ── CleanupMetadata: best-effort, never fails the session ────────
        self.emit(SessionState::CleanupMetadata, summary);
        if self.options.cleanup_metadata {
            match self.store.prune(progress.last_local_watermark_sent).await {
                Ok(removed) => debug!(removed, "pruned local tracking metadata"),
                Err(error) => warn!(error = %error, "local metadata prune failed"),
            }
        }

        Ok(conflicts)
    }
}
