//! Per-(scope, client) advisory session locks.
//!
//! Acquired at EnsureScope and held for the session lifetime. Contention is
//! denied immediately rather than queued: a second session for the same pair
//! is a caller bug or a stale session, and waiting on it invites deadlocks.

use rowsync_core::{ReplicaId, SyncError, SyncResult};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct SessionLockRegistry {
    held: Mutex<HashSet<(String, ReplicaId)>>,
}

impl SessionLockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Try to take the lock for `(scope, client)`. Fails with
    /// `ConcurrentSessionDenied` when it is already held.
    pub fn try_acquire(
        self: &Arc<Self>,
        scope: &str,
        client: ReplicaId,
    ) -> SyncResult<SessionLockGuard> {
        let key = (scope.to_string(), client);
        let mut held = self.held.lock().expect("session lock registry poisoned");
        if !held.insert(key.clone()) {
            return Err(SyncError::ConcurrentSessionDenied {
                scope: scope.to_string(),
                client,
            });
        }
        Ok(SessionLockGuard {
            registry: Arc::clone(self),
            key,
        })
    }
}

/// Releases the lock on drop, including on panic or cancellation.
#[derive(Debug)]
pub struct SessionLockGuard {
    registry: Arc<SessionLockRegistry>,
    key: (String, ReplicaId),
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.registry.held.lock() {
            held.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_denied() {
        let registry = SessionLockRegistry::new();
        let client = ReplicaId::generate();
        let _guard = registry.try_acquire("default", client).unwrap();

        let err = registry.try_acquire("default", client).unwrap_err();
        assert!(matches!(err, SyncError::ConcurrentSessionDenied { .. }));
    }

    #[test]
    fn different_pairs_run_in_parallel() {
        let registry = SessionLockRegistry::new();
        let a = ReplicaId::generate();
        let b = ReplicaId::generate();
        let _g1 = registry.try_acquire("default", a).unwrap();
        let _g2 = registry.try_acquire("default", b).unwrap();
        let _g3 = registry.try_acquire("other", a).unwrap();
    }

    #[test]
    fn drop_releases() {
        let registry = SessionLockRegistry::new();
        let client = ReplicaId::generate();
        {
            let _guard = registry.try_acquire("default", client).unwrap();
        }
        registry.try_acquire("default", client).unwrap();
    }
}
