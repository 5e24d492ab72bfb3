//! Server-side retention of in-flight outbound batches.
//!
//! A batch stays spooled while its receiver is still fetching parts. Entries
//! are evicted after `ttl` of inactivity, lazily on the next access; a fetch
//! against an evicted or unknown batch reports `IncompleteBatch` so the
//! receiver restarts change selection instead of resuming a vanished batch.

use crate::part::BatchPart;
use rowsync_core::{SyncError, SyncResult, Watermark};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

struct SpoolEntry {
    parts: Vec<BatchPart>,
    watermark: Watermark,
    last_access: Instant,
}

pub struct BatchSpool {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, SpoolEntry>>,
}

impl BatchSpool {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Retain a freshly split batch together with the watermark its
    /// selection was taken at. Returns the batch id (empty part lists are a
    /// caller bug upstream in `split`, which always emits at least one).
    pub fn insert(&self, parts: Vec<BatchPart>, watermark: Watermark) -> SyncResult<Uuid> {
        let batch_id = parts
            .first()
            .map(|p| p.batch_id)
            .ok_or_else(|| SyncError::Payload("cannot spool an empty part list".into()))?;
        let mut entries = self.entries.lock().expect("spool lock poisoned");
        entries.insert(
            batch_id,
            SpoolEntry {
                parts,
                watermark,
                last_access: Instant::now(),
            },
        );
        debug!(batch_id = %batch_id, "spooled batch");
        Ok(batch_id)
    }

    /// Fetch one part by index, refreshing the idle timer. Evicted, unknown,
    /// or out-of-range requests surface as `IncompleteBatch` naming the part.
    pub fn part(&self, batch_id: Uuid, index: u32) -> SyncResult<(BatchPart, Watermark)> {
        let mut entries = self.entries.lock().expect("spool lock poisoned");
        self.evict_expired(&mut entries);

        let entry = entries.get_mut(&batch_id).ok_or(SyncError::IncompleteBatch {
            batch_id,
            missing: vec![index],
        })?;
        entry.last_access = Instant::now();
        let part = entry
            .parts
            .get(index as usize)
            .cloned()
            .ok_or(SyncError::IncompleteBatch {
                batch_id,
                missing: vec![index],
            })?;
        Ok((part, entry.watermark))
    }

    /// Drop a fully delivered batch.
    pub fn remove(&self, batch_id: Uuid) {
        let mut entries = self.entries.lock().expect("spool lock poisoned");
        entries.remove(&batch_id);
    }

    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().expect("spool lock poisoned");
        self.evict_expired(&mut entries);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(&self, entries: &mut HashMap<Uuid, SpoolEntry>) {
        let ttl = self.ttl;
        let before = entries.len();
        entries.retain(|_, e| e.last_access.elapsed() <= ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            warn!(evicted, "evicted expired in-flight batches");
        }
    }
}
