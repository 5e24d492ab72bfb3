use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine tuning knobs (loadable from rowsync.toml).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Upper bound on one serialized batch part, in bytes. A part always
    /// holds at least one row even if that row alone exceeds the bound.
    pub max_part_size_bytes: usize,
    /// Per-request transport timeout in milliseconds.
    pub transport_timeout_ms: u64,
    /// Retry attempts for a timed-out request before the session fails.
    pub max_transfer_retries: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Server-side retention for in-flight (not yet fully delivered)
    /// batches, in seconds. An evicted batch forces the client to restart
    /// change selection.
    pub in_flight_ttl_secs: u64,
    /// Prune tracking metadata during session cleanup.
    pub cleanup_metadata: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_part_size_bytes: 512 * 1024,
            transport_timeout_ms: 30_000,
            max_transfer_retries: 3,
            retry_backoff_ms: 250,
            in_flight_ttl_secs: 300,
            cleanup_metadata: true,
        }
    }
}

impl SyncOptions {
    /// Load options from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading options {}: {e}", path.display()))?;
        let options = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing options {}: {e}", path.display()))?;
        Ok(options)
    }
}
