//! Row-level change records and immutable change sets.

use crate::stats::ChangesSelected;
use crate::value::{RowKey, Value};
use crate::watermark::Watermark;
use serde::{Deserialize, Serialize};

/// The operation a change carries. Inserts and updates collapse into
/// `Upsert`: the receiver cannot know (and does not care) whether the row
/// already exists on its side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOp {
    Upsert,
    Delete,
}

/// One changed row as selected from the tracking store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    pub key: RowKey,
    pub op: RowOp,
    /// Column values in table column order. Always empty for deletes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
    /// Watermark of the mutation on the side that produced this change.
    pub source_watermark: Watermark,
}

impl RowChange {
    pub fn upsert(
        table: impl Into<String>,
        key: RowKey,
        values: Vec<Value>,
        source_watermark: Watermark,
    ) -> Self {
        Self {
            table: table.into(),
            key,
            op: RowOp::Upsert,
            values,
            source_watermark,
        }
    }

    pub fn delete(table: impl Into<String>, key: RowKey, source_watermark: Watermark) -> Self {
        Self {
            table: table.into(),
            key,
            op: RowOp::Delete,
            values: Vec::new(),
            source_watermark,
        }
    }
}

/// Ordered sequence of row changes for one scope. Immutable once produced by
/// the builder; the batch manager slices it without reordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub scope: String,
    pub rows: Vec<RowChange>,
}

impl ChangeSet {
    pub fn new(scope: impl Into<String>, rows: Vec<RowChange>) -> Self {
        Self {
            scope: scope.into(),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Highest source watermark carried by any row, or ZERO when empty.
    pub fn max_watermark(&self) -> Watermark {
        self.rows
            .iter()
            .map(|r| r.source_watermark)
            .max()
            .unwrap_or(Watermark::ZERO)
    }

    pub fn selected_stats(&self) -> ChangesSelected {
        let mut stats = ChangesSelected::default();
        for row in &self.rows {
            stats.record(row.op);
        }
        stats
    }
}
