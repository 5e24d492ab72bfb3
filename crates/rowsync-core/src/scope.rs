//! Scopes: named, filtered subsets of schema synchronized as one unit.
//!
//! A `Scope` carries the table descriptors, per-table filters, and the
//! conflict policy for one logical replication unit. The `ScopeRegistry`
//! holds every provisioned scope plus any registered merge handlers and is
//! the single place where scope configuration is validated.

use crate::error::{SyncError, SyncResult};
use crate::row::RowChange;
use crate::value::{RowKey, Value};
use crate::watermark::{ReplicaId, Watermark};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Bool,
    Integer,
    Real,
    Text,
    Blob,
}

impl ColumnKind {
    fn admits(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ColumnKind::Bool, Value::Bool(_))
                | (ColumnKind::Integer, Value::Integer(_))
                | (ColumnKind::Real, Value::Real(_))
                | (ColumnKind::Text, Value::Text(_))
                | (ColumnKind::Blob, Value::Blob(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl ColumnDescriptor {
    /// A non-nullable column.
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A foreign-key edge from this table's columns to a parent table.
/// Drives the referential ordering of built change sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub parent_table: String,
}

/// Typed per-table row predicate, applied before a row enters a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFilter {
    Equals { column: String, value: Value },
    In { column: String, values: Vec<Value> },
}

impl RowFilter {
    fn column(&self) -> &str {
        match self {
            RowFilter::Equals { column, .. } | RowFilter::In { column, .. } => column,
        }
    }

    /// Evaluate against a full row in table column order.
    pub fn matches(&self, table: &TableDescriptor, row: &[Value]) -> bool {
        let Some(idx) = table.column_index(self.column()) else {
            return false;
        };
        let Some(cell) = row.get(idx) else {
            return false;
        };
        match self {
            RowFilter::Equals { value, .. } => cell == value,
            RowFilter::In { values, .. } => values.contains(cell),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub filter: Option<RowFilter>,
}

impl TableDescriptor {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<ColumnDescriptor>,
        primary_key: Vec<&str>,
    ) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: primary_key.into_iter().map(String::from).collect(),
            foreign_keys: Vec::new(),
            filter: None,
        }
    }

    pub fn with_foreign_key(mut self, columns: Vec<&str>, parent_table: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKey {
            columns: columns.into_iter().map(String::from).collect(),
            parent_table: parent_table.into(),
        });
        self
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Extract the primary-key tuple from a full row.
    pub fn key_of(&self, row: &[Value]) -> Option<RowKey> {
        let mut key = Vec::with_capacity(self.primary_key.len());
        for pk in &self.primary_key {
            key.push(row.get(self.column_index(pk)?)?.clone());
        }
        Some(RowKey(key))
    }

    /// Constraint check for an incoming row: arity, types, nullability.
    /// Returns the violation as a readable reason.
    pub fn check_row(&self, row: &[Value]) -> Result<(), String> {
        if row.len() != self.columns.len() {
            return Err(format!(
                "expected {} columns, got {}",
                self.columns.len(),
                row.len()
            ));
        }
        for (col, cell) in self.columns.iter().zip(row) {
            if cell.is_null() {
                if !col.nullable {
                    return Err(format!("null in non-nullable column '{}'", col.name));
                }
            } else if !col.kind.admits(cell) {
                return Err(format!(
                    "value {cell} does not match column '{}' ({:?})",
                    col.name, col.kind
                ));
            }
        }
        Ok(())
    }
}

/// The configured conflict resolution policy for a scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The server-side value wins, no matter which side resolves.
    #[default]
    ServerWins,
    /// The value originating from the client wins.
    ClientWins,
    /// A registered merge handler combines both rows.
    Merge,
}

/// Merge handler: `(current local row, incoming change) -> merged row`.
/// Required before session start whenever the scope policy is `Merge`.
/// Handlers should be idempotent: merging an already-merged row with the
/// same incoming change again must yield the same row, since interrupted
/// transfers replay parts.
pub type MergeFn = Arc<dyn Fn(&[Value], &RowChange) -> Vec<Value> + Send + Sync>;

/// One logical replication unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub name: String,
    /// Schema version; both sides must agree before any transfer.
    pub version: u32,
    pub tables: Vec<TableDescriptor>,
    pub policy: ConflictPolicy,
}

impl Scope {
    pub fn new(name: impl Into<String>, tables: Vec<TableDescriptor>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            tables,
            policy: ConflictPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }

    fn invalid(&self, reason: impl Into<String>) -> SyncError {
        SyncError::InvalidScope {
            scope: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Validate structure: table uniqueness, key/filter/FK column references,
    /// FK parents inside the scope, and an acyclic dependency graph.
    pub fn validate(&self) -> SyncResult<()> {
        if self.tables.is_empty() {
            return Err(self.invalid("scope has no tables"));
        }
        let mut seen = HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.as_str()) {
                return Err(self.invalid(format!("duplicate table '{}'", table.name)));
            }
            if table.primary_key.is_empty() {
                return Err(self.invalid(format!("table '{}' has no primary key", table.name)));
            }
            for pk in &table.primary_key {
                if table.column_index(pk).is_none() {
                    return Err(self.invalid(format!(
                        "table '{}' key column '{pk}' does not exist",
                        table.name
                    )));
                }
            }
            if let Some(filter) = &table.filter {
                if table.column_index(filter.column()).is_none() {
                    return Err(self.invalid(format!(
                        "table '{}' filter column '{}' does not exist",
                        table.name,
                        filter.column()
                    )));
                }
            }
            for fk in &table.foreign_keys {
                if self.table(&fk.parent_table).is_none() {
                    return Err(self.invalid(format!(
                        "table '{}' references '{}' which is not in the scope",
                        table.name, fk.parent_table
                    )));
                }
                for col in &fk.columns {
                    if table.column_index(col).is_none() {
                        return Err(self.invalid(format!(
                            "table '{}' FK column '{col}' does not exist",
                            table.name
                        )));
                    }
                }
            }
        }
        self.dependency_order()?;
        Ok(())
    }

    /// Tables ordered parents-before-children along FK edges, preserving the
    /// declared order among independent tables. Errors on a cycle.
    pub fn dependency_order(&self) -> SyncResult<Vec<&TableDescriptor>> {
        let index: HashMap<&str, usize> = self
            .tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();

        // in-degree = number of distinct in-scope parents
        let mut pending: Vec<usize> = vec![0; self.tables.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.tables.len()];
        for (i, table) in self.tables.iter().enumerate() {
            let mut parents = HashSet::new();
            for fk in &table.foreign_keys {
                if fk.parent_table == table.name {
                    continue; // self-reference orders trivially
                }
                if let Some(&p) = index.get(fk.parent_table.as_str()) {
                    if parents.insert(p) {
                        pending[i] += 1;
                        children[p].push(i);
                    }
                }
            }
        }

        let mut ready: Vec<usize> = (0..self.tables.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(self.tables.len());
        while let Some(i) = ready.first().copied() {
            ready.remove(0);
            order.push(&self.tables[i]);
            for &child in &children[i] {
                pending[child] -= 1;
                if pending[child] == 0 {
                    // keep declaration order among newly ready tables
                    let pos = ready.partition_point(|&r| r < child);
                    ready.insert(pos, child);
                }
            }
        }

        if order.len() != self.tables.len() {
            return Err(self.invalid("foreign keys form a cycle"));
        }
        Ok(order)
    }
}

/// Registry of provisioned scopes and their merge handlers.
#[derive(Default)]
pub struct ScopeRegistry {
    scopes: HashMap<String, Scope>,
    merge_handlers: HashMap<String, MergeFn>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a scope, replacing any previous definition.
    pub fn register(&mut self, scope: Scope) -> SyncResult<()> {
        scope.validate()?;
        self.scopes.insert(scope.name.clone(), scope);
        Ok(())
    }

    pub fn register_merge(&mut self, scope_name: impl Into<String>, handler: MergeFn) {
        self.merge_handlers.insert(scope_name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&Scope> {
        self.scopes.get(name)
    }

    pub fn merge_handler(&self, name: &str) -> Option<MergeFn> {
        self.merge_handlers.get(name).cloned()
    }

    /// Fetch a scope that must exist, checking merge configuration up front.
    /// A merge policy without a handler is a configuration error raised here,
    /// before any session work, never at conflict time.
    pub fn checked(&self, name: &str) -> SyncResult<&Scope> {
        let scope = self
            .scopes
            .get(name)
            .ok_or_else(|| SyncError::SchemaMismatch(format!("scope '{name}' is not provisioned")))?;
        if scope.policy == ConflictPolicy::Merge && !self.merge_handlers.contains_key(name) {
            return Err(SyncError::ConflictUnresolved(name.to_string()));
        }
        Ok(scope)
    }
}

/// Client-owned progress for one (scope, client) pair. Updated only at a
/// successful session commit; both watermarks are monotone non-decreasing
/// across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeInfoClient {
    pub scope_name: String,
    pub client_id: ReplicaId,
    /// Highest server watermark this client has durably applied.
    pub last_server_watermark_received: Watermark,
    /// Highest local watermark the server has acknowledged receiving.
    pub last_local_watermark_sent: Watermark,
}

impl ScopeInfoClient {
    pub fn new(scope_name: impl Into<String>, client_id: ReplicaId) -> Self {
        Self {
            scope_name: scope_name.into(),
            client_id,
            last_server_watermark_received: Watermark::ZERO,
            last_local_watermark_sent: Watermark::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category() -> TableDescriptor {
        TableDescriptor::new(
            "category",
            vec![
                ColumnDescriptor::new("id", ColumnKind::Integer),
                ColumnDescriptor::new("name", ColumnKind::Text).nullable(),
            ],
            vec!["id"],
        )
    }

    fn product() -> TableDescriptor {
        TableDescriptor::new(
            "product",
            vec![
                ColumnDescriptor::new("id", ColumnKind::Integer),
                ColumnDescriptor::new("category_id", ColumnKind::Integer),
                ColumnDescriptor::new("price", ColumnKind::Real).nullable(),
            ],
            vec!["id"],
        )
        .with_foreign_key(vec!["category_id"], "category")
    }

    #[test]
    fn dependency_order_parents_first() {
        // product declared first; order must still put category ahead
        let scope = Scope::new("default", vec![product(), category()]);
        let order: Vec<&str> = scope
            .dependency_order()
            .unwrap()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(order, vec!["category", "product"]);
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let a = TableDescriptor::new(
            "a",
            vec![ColumnDescriptor::new("id", ColumnKind::Integer)],
            vec!["id"],
        )
        .with_foreign_key(vec!["id"], "b");
        let b = TableDescriptor::new(
            "b",
            vec![ColumnDescriptor::new("id", ColumnKind::Integer)],
            vec!["id"],
        )
        .with_foreign_key(vec!["id"], "a");

        let err = Scope::new("cyclic", vec![a, b]).validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn self_reference_is_allowed() {
        let employee = TableDescriptor::new(
            "employee",
            vec![
                ColumnDescriptor::new("id", ColumnKind::Integer),
                ColumnDescriptor::new("manager_id", ColumnKind::Integer).nullable(),
            ],
            vec!["id"],
        )
        .with_foreign_key(vec!["manager_id"], "employee");
        Scope::new("org", vec![employee]).validate().unwrap();
    }

    #[test]
    fn validate_rejects_unknown_fk_parent() {
        let orphan = TableDescriptor::new(
            "orphan",
            vec![ColumnDescriptor::new("id", ColumnKind::Integer)],
            vec!["id"],
        )
        .with_foreign_key(vec!["id"], "missing");
        let err = Scope::new("s", vec![orphan]).validate().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn validate_rejects_missing_pk_column() {
        let bad = TableDescriptor::new(
            "bad",
            vec![ColumnDescriptor::new("id", ColumnKind::Integer)],
            vec!["uid"],
        );
        assert!(Scope::new("s", vec![bad]).validate().is_err());
    }

    #[test]
    fn check_row_catches_violations() {
        let table = product();
        assert!(table
            .check_row(&[1i64.into(), 5i64.into(), Value::Real(9.99)])
            .is_ok());
        assert!(table
            .check_row(&[1i64.into(), 5i64.into(), Value::Null])
            .is_ok());
        // null FK column is non-nullable
        let reason = table
            .check_row(&[1i64.into(), Value::Null, Value::Null])
            .unwrap_err();
        assert!(reason.contains("category_id"));
        // arity
        assert!(table.check_row(&[1i64.into()]).is_err());
        // type mismatch
        assert!(table
            .check_row(&["x".into(), 5i64.into(), Value::Null])
            .is_err());
    }

    #[test]
    fn filter_matches_rows() {
        let table = product().with_filter(RowFilter::Equals {
            column: "category_id".into(),
            value: 5i64.into(),
        });
        let filter = table.filter.clone().unwrap();
        assert!(filter.matches(&table, &[1i64.into(), 5i64.into(), Value::Null]));
        assert!(!filter.matches(&table, &[1i64.into(), 6i64.into(), Value::Null]));
    }

    #[test]
    fn key_extraction() {
        let table = product();
        let key = table
            .key_of(&[9i64.into(), 5i64.into(), Value::Null])
            .unwrap();
        assert_eq!(key, RowKey::single(9i64));
    }

    #[test]
    fn registry_checks_merge_handler() {
        let mut registry = ScopeRegistry::new();
        registry
            .register(Scope::new("m", vec![category()]).with_policy(ConflictPolicy::Merge))
            .unwrap();

        // merge policy without a handler is a config error, found up front
        assert!(matches!(
            registry.checked("m").unwrap_err(),
            SyncError::ConflictUnresolved(_)
        ));

        registry.register_merge("m", Arc::new(|local, _remote| local.to_vec()));
        assert!(registry.checked("m").is_ok());
    }

    #[test]
    fn registry_unknown_scope() {
        let registry = ScopeRegistry::new();
        assert!(matches!(
            registry.checked("nope").unwrap_err(),
            SyncError::SchemaMismatch(_)
        ));
    }
}
