//! Concurrent-edit detection and policy resolution.
//!
//! A conflict exists when an incoming change touches a key whose local
//! version was modified after the watermark the sender last received from
//! this side: both replicas edited independently since their last exchange.
//! Resolution is a pure function of (local, incoming, policy), so identical
//! inputs always resolve identically, on either side of the link.

use rowsync_core::{
    ConflictCounts, ConflictPolicy, MergeFn, ReplicaId, RowChange, RowKey, RowOp, SyncError,
    SyncResult, Value, Watermark,
};
use rowsync_tracking::TrackedRow;
use tracing::debug;

/// Which end of the exchange a change originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSide {
    Server,
    Client,
}

impl SyncSide {
    pub fn opposite(self) -> SyncSide {
        match self {
            SyncSide::Server => SyncSide::Client,
            SyncSide::Client => SyncSide::Server,
        }
    }
}

/// How one conflict was settled. Transient: reported after apply, never
/// persisted beyond the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    Unresolved,
    ServerWins,
    ClientWins,
    Merged(Vec<Value>),
}

impl ConflictResolution {
    fn label(&self) -> &'static str {
        match self {
            ConflictResolution::Unresolved => "unresolved",
            ConflictResolution::ServerWins => "server_wins",
            ConflictResolution::ClientWins => "client_wins",
            ConflictResolution::Merged(_) => "merged",
        }
    }
}

/// What the applier must do with the incoming change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionAction {
    /// Write the incoming change as-is (delete included).
    ApplyIncoming,
    /// The local version stands; nothing is written.
    KeepLocal,
    /// Write these merged values as an upsert.
    WriteMerged(Vec<Value>),
}

/// One detected conflict and its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub table: String,
    pub key: RowKey,
    pub local: TrackedRow,
    pub remote_op: RowOp,
    pub resolution: ConflictResolution,
}

impl Conflict {
    pub fn count_into(&self, counts: &mut ConflictCounts) {
        match &self.resolution {
            ConflictResolution::Unresolved => counts.unresolved += 1,
            ConflictResolution::ServerWins => counts.server_wins += 1,
            ConflictResolution::ClientWins => counts.client_wins += 1,
            ConflictResolution::Merged(_) => counts.merged += 1,
        }
    }
}

/// True when the incoming change collides with an independent local edit.
///
/// No conflict when the key is untracked locally, when the local version
/// already came from the sender (it cannot conflict with itself), or when
/// the local edit is old enough that the sender had already seen it.
pub fn detect(local: Option<&TrackedRow>, sender: ReplicaId, sender_acked: Watermark) -> bool {
    match local {
        None => false,
        Some(tracked) => tracked.origin != sender && tracked.watermark > sender_acked,
    }
}

/// Resolves conflicts under one scope's configured policy.
pub struct ConflictResolver {
    policy: ConflictPolicy,
    merge: Option<MergeFn>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("policy", &self.policy)
            .field("merge", &self.merge.as_ref().map(|_| "<merge fn>"))
            .finish()
    }
}

impl ConflictResolver {
    /// A merge policy without a handler is rejected here, at construction,
    /// long before any conflict shows up.
    pub fn new(
        scope_name: &str,
        policy: ConflictPolicy,
        merge: Option<MergeFn>,
    ) -> SyncResult<Self> {
        if policy == ConflictPolicy::Merge && merge.is_none() {
            return Err(SyncError::ConflictUnresolved(scope_name.to_string()));
        }
        Ok(Self { policy, merge })
    }

    /// Settle one conflict. `incoming_from` names the side the incoming
    /// change originates from; the local row belongs to the opposite side.
    /// Returns the report plus the action the applier must take.
    pub fn resolve(
        &self,
        local: &TrackedRow,
        local_values: Option<&[Value]>,
        incoming: &RowChange,
        incoming_from: SyncSide,
    ) -> (Conflict, ResolutionAction) {
        let local_side = incoming_from.opposite();

        let (resolution, action) = match self.policy {
            ConflictPolicy::ServerWins => pick_side(SyncSide::Server, incoming_from),
            ConflictPolicy::ClientWins => pick_side(SyncSide::Client, incoming_from),
            ConflictPolicy::Merge => {
                // Delete-vs-update under merge: there is nothing to merge
                // with, so the deleting side wins outright.
                if incoming.op == RowOp::Delete {
                    pick_side(incoming_from, incoming_from)
                } else if local.tombstone {
                    pick_side(local_side, incoming_from)
                } else {
                    match &self.merge {
                        Some(handler) => {
                            let merged = handler(local_values.unwrap_or(&[]), incoming);
                            (
                                ConflictResolution::Merged(merged.clone()),
                                ResolutionAction::WriteMerged(merged),
                            )
                        }
                        // unreachable through the public constructor; keep
                        // the row rather than guessing a winner
                        None => (ConflictResolution::Unresolved, ResolutionAction::KeepLocal),
                    }
                }
            }
        };

        debug!(
            table = %incoming.table,
            key = %incoming.key,
            resolution = resolution.label(),
            "conflict resolved"
        );

        (
            Conflict {
                table: incoming.table.clone(),
                key: incoming.key.clone(),
                local: local.clone(),
                remote_op: incoming.op,
                resolution,
            },
            action,
        )
    }
}

fn pick_side(
    winner: SyncSide,
    incoming_from: SyncSide,
) -> (ConflictResolution, ResolutionAction) {
    let resolution = match winner {
        SyncSide::Server => ConflictResolution::ServerWins,
        SyncSide::Client => ConflictResolution::ClientWins,
    };
    let action = if winner == incoming_from {
        ResolutionAction::ApplyIncoming
    } else {
        ResolutionAction::KeepLocal
    };
    (resolution, action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracked(origin: ReplicaId, watermark: u64, tombstone: bool) -> TrackedRow {
        TrackedRow {
            table: "item".into(),
            key: RowKey::single(1i64),
            watermark: Watermark(watermark),
            origin,
            source_watermark: Watermark(watermark),
            tombstone,
        }
    }

    fn incoming_upsert() -> RowChange {
        RowChange::upsert(
            "item",
            RowKey::single(1i64),
            vec![1i64.into(), "remote".into()],
            Watermark(50),
        )
    }

    #[test]
    fn absent_local_is_no_conflict() {
        assert!(!detect(None, ReplicaId::generate(), Watermark(0)));
    }

    #[test]
    fn old_local_edit_is_no_conflict() {
        let local = tracked(ReplicaId::generate(), 10, false);
        // sender already received everything up to 10
        assert!(!detect(Some(&local), ReplicaId::generate(), Watermark(10)));
    }

    #[test]
    fn senders_own_row_is_no_conflict() {
        let sender = ReplicaId::generate();
        let local = tracked(sender, 99, false);
        assert!(!detect(Some(&local), sender, Watermark(0)));
    }

    #[test]
    fn fresh_independent_edit_conflicts() {
        let local = tracked(ReplicaId::generate(), 11, false);
        assert!(detect(Some(&local), ReplicaId::generate(), Watermark(10)));
    }

    #[test]
    fn server_wins_applies_incoming_from_server() {
        let resolver =
            ConflictResolver::new("s", ConflictPolicy::ServerWins, None).unwrap();
        let local = tracked(ReplicaId::generate(), 11, false);
        let (conflict, action) =
            resolver.resolve(&local, None, &incoming_upsert(), SyncSide::Server);
        assert_eq!(conflict.resolution, ConflictResolution::ServerWins);
        assert_eq!(action, ResolutionAction::ApplyIncoming);
    }

    #[test]
    fn server_wins_keeps_local_on_server() {
        // same policy, resolution running on the server against a client
        // change: the server row stands
        let resolver =
            ConflictResolver::new("s", ConflictPolicy::ServerWins, None).unwrap();
        let local = tracked(ReplicaId::generate(), 11, false);
        let (conflict, action) =
            resolver.resolve(&local, None, &incoming_upsert(), SyncSide::Client);
        assert_eq!(conflict.resolution, ConflictResolution::ServerWins);
        assert_eq!(action, ResolutionAction::KeepLocal);
    }

    #[test]
    fn client_wins_mirrors() {
        let resolver =
            ConflictResolver::new("s", ConflictPolicy::ClientWins, None).unwrap();
        let local = tracked(ReplicaId::generate(), 11, false);
        let (_, from_client) =
            resolver.resolve(&local, None, &incoming_upsert(), SyncSide::Client);
        assert_eq!(from_client, ResolutionAction::ApplyIncoming);
        let (_, from_server) =
            resolver.resolve(&local, None, &incoming_upsert(), SyncSide::Server);
        assert_eq!(from_server, ResolutionAction::KeepLocal);
    }

    #[test]
    fn merge_without_handler_is_config_error() {
        let err = ConflictResolver::new("s", ConflictPolicy::Merge, None).unwrap_err();
        assert!(matches!(err, SyncError::ConflictUnresolved(_)));
    }

    #[test]
    fn merge_combines_both_rows() {
        let handler: MergeFn = Arc::new(|local, remote| {
            // keep local first column, remote second
            vec![local[0].clone(), remote.values[1].clone()]
        });
        let resolver =
            ConflictResolver::new("s", ConflictPolicy::Merge, Some(handler)).unwrap();
        let local = tracked(ReplicaId::generate(), 11, false);
        let local_values = vec![Value::Integer(1), Value::Text("local".into())];
        let (conflict, action) =
            resolver.resolve(&local, Some(&local_values), &incoming_upsert(), SyncSide::Server);

        let expected = vec![Value::Integer(1), Value::Text("remote".into())];
        assert_eq!(conflict.resolution, ConflictResolution::Merged(expected.clone()));
        assert_eq!(action, ResolutionAction::WriteMerged(expected));
    }

    #[test]
    fn merge_delete_vs_update_lets_delete_win() {
        let handler: MergeFn = Arc::new(|_, remote| remote.values.clone());
        let resolver =
            ConflictResolver::new("s", ConflictPolicy::Merge, Some(handler)).unwrap();

        // incoming delete wins over the local update
        let local = tracked(ReplicaId::generate(), 11, false);
        let delete = RowChange::delete("item", RowKey::single(1i64), Watermark(50));
        let (conflict, action) = resolver.resolve(&local, None, &delete, SyncSide::Server);
        assert_eq!(action, ResolutionAction::ApplyIncoming);
        assert_eq!(conflict.resolution, ConflictResolution::ServerWins);

        // local tombstone wins over the incoming update
        let gone = tracked(ReplicaId::generate(), 11, true);
        let (conflict, action) =
            resolver.resolve(&gone, None, &incoming_upsert(), SyncSide::Server);
        assert_eq!(action, ResolutionAction::KeepLocal);
        assert_eq!(conflict.resolution, ConflictResolution::ClientWins);
    }

    #[test]
    fn delete_wins_regardless_of_losing_columns() {
        let resolver =
            ConflictResolver::new("s", ConflictPolicy::ServerWins, None).unwrap();
        let local = tracked(ReplicaId::generate(), 11, false);
        let delete = RowChange::delete("item", RowKey::single(1i64), Watermark(50));
        let (_, action) = resolver.resolve(&local, None, &delete, SyncSide::Server);
        // winning server op is a delete: the row goes away
        assert_eq!(action, ResolutionAction::ApplyIncoming);
    }

    mod determinism {
        use super::*;
        use proptest::prelude::*;

        fn arb_policy() -> impl Strategy<Value = ConflictPolicy> {
            prop_oneof![
                Just(ConflictPolicy::ServerWins),
                Just(ConflictPolicy::ClientWins),
                Just(ConflictPolicy::Merge),
            ]
        }

        fn arb_side() -> impl Strategy<Value = SyncSide> {
            prop_oneof![Just(SyncSide::Server), Just(SyncSide::Client)]
        }

        proptest! {
            /// Identical (local, remote, policy) always resolves identically.
            #[test]
            fn resolution_is_deterministic(
                policy in arb_policy(),
                side in arb_side(),
                local_tombstone in any::<bool>(),
                incoming_delete in any::<bool>(),
            ) {
                let handler: MergeFn = Arc::new(|_, remote| remote.values.clone());
                let resolver =
                    ConflictResolver::new("s", policy, Some(handler)).unwrap();
                let local = tracked(ReplicaId::generate(), 11, local_tombstone);
                let incoming = if incoming_delete {
                    RowChange::delete("item", RowKey::single(1i64), Watermark(50))
                } else {
                    incoming_upsert()
                };
                let values = vec![Value::Integer(1), Value::Text("l".into())];

                let (c1, a1) = resolver.resolve(&local, Some(&values), &incoming, side);
                let (c2, a2) = resolver.resolve(&local, Some(&values), &incoming, side);
                prop_assert_eq!(c1.resolution, c2.resolution);
                prop_assert_eq!(a1, a2);
            }

            /// The winning side is the same no matter which side executes
            /// the resolution.
            #[test]
            fn winner_is_side_independent(
                policy in prop_oneof![
                    Just(ConflictPolicy::ServerWins),
                    Just(ConflictPolicy::ClientWins),
                ],
                incoming_delete in any::<bool>(),
            ) {
                let resolver_a = ConflictResolver::new("s", policy, None).unwrap();
                let resolver_b = ConflictResolver::new("s", policy, None).unwrap();
                let local = tracked(ReplicaId::generate(), 11, false);
                let incoming = if incoming_delete {
                    RowChange::delete("item", RowKey::single(1i64), Watermark(50))
                } else {
                    incoming_upsert()
                };

                // resolution on the client (incoming from server) and on the
                // server (incoming from client) must name the same winner
                let (on_client, _) =
                    resolver_a.resolve(&local, None, &incoming, SyncSide::Server);
                let (on_server, _) =
                    resolver_b.resolve(&local, None, &incoming, SyncSide::Client);
                prop_assert_eq!(on_client.resolution, on_server.resolution);
            }
        }
    }
}
