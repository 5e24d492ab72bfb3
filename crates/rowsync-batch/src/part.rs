//! Batch parts and their payload codec.
//!
//! A part's payload is a versioned JSON envelope. Decoding rejects unknown
//! versions outright rather than guessing at field meanings.

use bytes::Bytes;
use rowsync_core::{RowChange, SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current payload envelope version.
pub const PAYLOAD_VERSION: u32 = 1;

/// One independently transferable slice of a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPart {
    pub batch_id: Uuid,
    pub part_index: u32,
    pub part_count: u32,
    pub is_last: bool,
    pub payload: Bytes,
}

impl BatchPart {
    /// Decode the rows carried by this part.
    pub fn rows(&self) -> SyncResult<Vec<RowChange>> {
        Ok(PartPayload::from_bytes(&self.payload)?.rows)
    }

    /// Decode the scope name stamped into the payload.
    pub fn scope(&self) -> SyncResult<String> {
        Ok(PartPayload::from_bytes(&self.payload)?.scope)
    }
}

/// The serialized content of one part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartPayload {
    pub version: u32,
    pub scope: String,
    pub rows: Vec<RowChange>,
}

impl PartPayload {
    pub fn new(scope: impl Into<String>, rows: Vec<RowChange>) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            scope: scope.into(),
            rows,
        }
    }

    pub fn from_bytes(data: &[u8]) -> SyncResult<Self> {
        let payload: PartPayload = serde_json::from_slice(data)
            .map_err(|e| SyncError::Payload(format!("decoding part payload: {e}")))?;
        if payload.version != PAYLOAD_VERSION {
            return Err(SyncError::Payload(format!(
                "unsupported payload version {} (expected {PAYLOAD_VERSION})",
                payload.version
            )));
        }
        Ok(payload)
    }

    pub fn to_bytes(&self) -> SyncResult<Bytes> {
        let raw = serde_json::to_vec(self)
            .map_err(|e| SyncError::Payload(format!("encoding part payload: {e}")))?;
        Ok(Bytes::from(raw))
    }
}
