//! Protocol messages exchanged over the transport collaborator.
//!
//! Four request/response pairs drive a session: ensure-scope, get-changes,
//! send-changes, end-session. Wire framing is the transport's business;
//! these structs only define the payloads.

use rowsync_batch::BatchPart;
use rowsync_core::{
    ChangesApplied, ChangesSelected, ConflictCounts, ConflictPolicy, ReplicaId, Scope,
    ScopeInfoClient, SessionSummary, Watermark,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureScopeRequest {
    pub scope_name: String,
    pub client_id: ReplicaId,
    /// Schema version of the client's local scope definition.
    pub schema_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureScopeResponse {
    pub schema: Scope,
    pub policy: ConflictPolicy,
    /// Identity of the server replica; incoming server changes are applied
    /// under this origin.
    pub server_id: ReplicaId,
    pub server_watermark: Watermark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChangesRequest {
    pub scope_name: String,
    pub client_id: ReplicaId,
    /// Highest server watermark the client has committed.
    pub client_watermark: Watermark,
    /// Index 0 (re)starts selection; higher indexes resume the spooled
    /// batch after the last part the client committed.
    pub batch_index_requested: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChangesResponse {
    pub part: BatchPart,
    pub batch_index: u32,
    pub batch_count: u32,
    pub is_last_batch: bool,
    /// Watermark the client commits once every part is applied.
    pub server_watermark: Watermark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendChangesRequest {
    pub scope_name: String,
    pub client_id: ReplicaId,
    /// Highest server watermark the client had received when it selected
    /// these changes; the server's conflict detection bound.
    pub client_acked_server_watermark: Watermark,
    pub part: BatchPart,
    pub batch_index: u32,
    pub batch_count: u32,
    pub is_last_batch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendChangesResponse {
    /// Filled on the last part, once the server has selected its own
    /// outbound changes for this client.
    pub server_selected: Option<ChangesSelected>,
    /// How this part's rows landed on the server.
    pub client_applied: ChangesApplied,
    pub conflicts: ConflictCounts,
    pub policy: ConflictPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndSessionRequest {
    pub scope_name: String,
    pub client_id: ReplicaId,
    /// The client's committed progress; the server persists it as the ack
    /// bound for metadata pruning.
    pub scope_info: ScopeInfoClient,
    pub summary: SessionSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndSessionResponse {}
