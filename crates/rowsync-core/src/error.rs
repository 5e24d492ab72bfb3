use crate::value::RowKey;
use crate::watermark::ReplicaId;
use thiserror::Error;
use uuid::Uuid;

pub type SyncResult<T> = Result<T, SyncError>;

/// Error taxonomy for the sync engine.
///
/// `ApplyFailure` is the only row-level variant: sessions record it and keep
/// going. `IncompleteBatch` and `TransportTimeout` are retried locally using
/// resumption state. Everything else aborts the session, rolling back only
/// the in-flight sub-transaction.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("incomplete batch {batch_id}: missing part indexes {missing:?}")]
    IncompleteBatch { batch_id: Uuid, missing: Vec<u32> },

    #[error("transport timed out after {attempts} attempts: {context}")]
    TransportTimeout { attempts: u32, context: String },

    #[error("failed to apply row {key} in table '{table}': {reason}")]
    ApplyFailure {
        table: String,
        key: RowKey,
        reason: String,
    },

    #[error("scope '{0}' uses the merge policy but no merge handler is registered")]
    ConflictUnresolved(String),

    #[error("a session is already running for scope '{scope}' and client {client}")]
    ConcurrentSessionDenied { scope: String, client: ReplicaId },

    #[error("session cancelled during {0}")]
    Cancelled(String),

    #[error("invalid scope '{scope}': {reason}")]
    InvalidScope { scope: String, reason: String },

    #[error("malformed batch payload: {0}")]
    Payload(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Row-level failures are recorded per row and never abort a session.
    pub fn is_row_level(&self) -> bool {
        matches!(self, SyncError::ApplyFailure { .. })
    }

    /// Failures the session retries locally before giving up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::IncompleteBatch { .. } | SyncError::TransportTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn apply_failure_is_row_level() {
        let err = SyncError::ApplyFailure {
            table: "product".into(),
            key: RowKey::single(9i64),
            reason: "null in non-nullable column".into(),
        };
        assert!(err.is_row_level());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("product"));
        assert!(err.to_string().contains("(9)"));
    }

    #[test]
    fn transport_timeout_is_retryable() {
        let err = SyncError::TransportTimeout {
            attempts: 3,
            context: "get_changes part 2".into(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_row_level());
    }

    #[test]
    fn incomplete_batch_names_missing_parts() {
        let err = SyncError::IncompleteBatch {
            batch_id: Uuid::nil(),
            missing: vec![1, 3],
        };
        assert!(err.to_string().contains("[1, 3]"));
    }

    #[test]
    fn anyhow_errors_flow_through() {
        fn storage_op() -> SyncResult<Value> {
            Err(anyhow::anyhow!("disk on fire").into())
        }
        let err = storage_op().unwrap_err();
        assert!(matches!(err, SyncError::Other(_)));
    }
}
