//! Session statistics: immutable summary values emitted as the session
//! progresses, replacing any shared mutable progress object.

use crate::row::RowOp;
use crate::value::RowKey;
use serde::{Deserialize, Serialize};

/// Counts of changes selected from a tracking store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesSelected {
    pub upserts: usize,
    pub deletes: usize,
}

impl ChangesSelected {
    pub fn record(&mut self, op: RowOp) {
        match op {
            RowOp::Upsert => self.upserts += 1,
            RowOp::Delete => self.deletes += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.upserts + self.deletes
    }
}

/// Counts of changes applied to a store, including replays and row failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesApplied {
    /// Rows written (including conflict winners).
    pub applied: usize,
    /// Rows skipped because the same change was already committed.
    pub replayed: usize,
    /// Rows that failed to apply and were recorded, not retried.
    pub failed: usize,
    /// Conflicts that went through policy resolution.
    pub conflicts_resolved: usize,
}

impl ChangesApplied {
    pub fn merge(&mut self, other: &ChangesApplied) {
        self.applied += other.applied;
        self.replayed += other.replayed;
        self.failed += other.failed;
        self.conflicts_resolved += other.conflicts_resolved;
    }
}

/// Conflicts grouped by how they were resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCounts {
    pub server_wins: usize,
    pub client_wins: usize,
    pub merged: usize,
    pub unresolved: usize,
}

impl ConflictCounts {
    pub fn total(&self) -> usize {
        self.server_wins + self.client_wins + self.merged + self.unresolved
    }

    pub fn merge(&mut self, other: &ConflictCounts) {
        self.server_wins += other.server_wins;
        self.client_wins += other.client_wins;
        self.merged += other.merged;
        self.unresolved += other.unresolved;
    }
}

/// A row that failed to apply. Row failures never fail the session; they are
/// reported here exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRow {
    pub table: String,
    pub key: RowKey,
    pub reason: String,
}

/// The user-visible result of one sync session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub scope: String,
    /// Changes selected locally and uploaded.
    pub client_selected: ChangesSelected,
    /// Changes the server selected for us.
    pub server_selected: ChangesSelected,
    /// Server changes applied to the local store.
    pub applied_local: ChangesApplied,
    /// Our changes applied on the server, as reported back.
    pub applied_remote: ChangesApplied,
    pub conflicts: ConflictCounts,
    pub failed_rows: Vec<FailedRow>,
}

impl SessionSummary {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applied_merge_accumulates() {
        let mut a = ChangesApplied {
            applied: 2,
            replayed: 1,
            failed: 0,
            conflicts_resolved: 1,
        };
        a.merge(&ChangesApplied {
            applied: 3,
            replayed: 0,
            failed: 2,
            conflicts_resolved: 0,
        });
        assert_eq!(a.applied, 5);
        assert_eq!(a.replayed, 1);
        assert_eq!(a.failed, 2);
        assert_eq!(a.conflicts_resolved, 1);
    }

    #[test]
    fn conflict_counts_total() {
        let counts = ConflictCounts {
            server_wins: 2,
            client_wins: 1,
            merged: 1,
            unresolved: 0,
        };
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn summary_serializes() {
        let summary = SessionSummary::new("default");
        let json = serde_json::to_string(&summary).unwrap();
        let back: SessionSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(summary, back);
    }
}
