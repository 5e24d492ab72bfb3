//! Applying one batch part's rows inside a single sub-transaction.
//!
//! Shared by both halves of the protocol: the responder applies inbound
//! client parts, the session applies downloaded server parts. A row-level
//! failure is recorded and processing continues; only fatal errors abort the
//! sub-transaction (staged writes are discarded, nothing else is touched).

use crate::conflict::{detect, Conflict, ConflictResolver, ResolutionAction, SyncSide};
use rowsync_core::{
    ChangesApplied, FailedRow, ReplicaId, RowChange, SyncError, SyncResult, Watermark,
};
use rowsync_tracking::{ApplyOutcome, TrackingStore};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct PartApplyResult {
    pub applied: ChangesApplied,
    pub conflicts: Vec<Conflict>,
    pub failed: Vec<FailedRow>,
}

/// Apply `rows` on behalf of `origin` in one sub-transaction.
///
/// `sender_acked` is the highest watermark of *this* store the sender had
/// received when it selected its changes; anything local above it is an
/// independent concurrent edit and goes through the resolver.
pub async fn apply_rows(
    store: &dyn TrackingStore,
    rows: &[RowChange],
    origin: ReplicaId,
    sender_acked: Watermark,
    resolver: &ConflictResolver,
    incoming_from: SyncSide,
) -> SyncResult<PartApplyResult> {
    let mut result = PartApplyResult::default();
    let mut tx = store.begin().await?;

    for row in rows {
        let tracked = store.tracked(&row.table, &row.key).await?;

        if detect(tracked.as_ref(), origin, sender_acked) {
            let local = match tracked {
                Some(t) => t,
                None => continue, // detect() is false for None
            };
            let local_values = store.read_row(&row.table, &row.key).await?;
            let (conflict, action) =
                resolver.resolve(&local, local_values.as_deref(), row, incoming_from);

            match action {
                ResolutionAction::ApplyIncoming => {
                    stage(&mut *tx, row, origin, &mut result).await?;
                }
                ResolutionAction::KeepLocal => {}
                // a merged row is a fresh local edit: it gets a new local
                // watermark and flows back to the sender on its next
                // download instead of being suppressed as an echo
                ResolutionAction::WriteMerged(values) => {
                    if let Err(error) = tx.put(&row.table, values).await {
                        warn!(
                            table = %row.table,
                            key = %row.key,
                            error = %error,
                            "merged row failed to apply"
                        );
                        result.applied.failed += 1;
                        result.failed.push(FailedRow {
                            table: row.table.clone(),
                            key: row.key.clone(),
                            reason: error.to_string(),
                        });
                    } else {
                        result.applied.applied += 1;
                    }
                }
            }
            result.applied.conflicts_resolved += 1;
            result.conflicts.push(conflict);
            continue;
        }

        stage(&mut *tx, row, origin, &mut result).await?;
    }

    let high = tx.commit().await?;
    debug!(
        origin = %origin,
        applied = result.applied.applied,
        replayed = result.applied.replayed,
        failed = result.applied.failed,
        conflicts = result.conflicts.len(),
        high_watermark = %high,
        "applied batch part"
    );
    Ok(result)
}

/// Stage one change, folding row-level failures into the result instead of
/// aborting. Fatal errors propagate and drop the whole sub-transaction.
async fn stage(
    tx: &mut dyn rowsync_tracking::StoreTx,
    change: &RowChange,
    origin: ReplicaId,
    result: &mut PartApplyResult,
) -> SyncResult<()> {
    match tx.apply_row(change, origin).await {
        Ok(ApplyOutcome::Applied) => result.applied.applied += 1,
        Ok(ApplyOutcome::Replayed) => result.applied.replayed += 1,
        Err(SyncError::ApplyFailure { table, key, reason }) => {
            warn!(table = %table, key = %key, reason = %reason, "row apply failed");
            result.applied.failed += 1;
            result.failed.push(FailedRow { table, key, reason });
        }
        Err(fatal) => return Err(fatal),
    }
    Ok(())
}
