//! Token-checked lock release

use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{LockError, Result};
use crate::stats::{LockStatsCollector, Operation};
use crate::store::LockStore;

/// Outcome of a release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// The lock was held with our token and has been deleted
    Released,
    /// The lock had already expired, or was re-acquired by another holder
    AlreadyReleased,
}

impl ReleaseStatus {
    pub fn already_released(&self) -> bool {
        matches!(self, ReleaseStatus::AlreadyReleased)
    }
}

/// Runs the atomic compare-and-delete against a shard's store.
pub struct ReleaseEngine {
    stats: Arc<LockStatsCollector>,
}

impl ReleaseEngine {
    pub(crate) fn new(stats: Arc<LockStatsCollector>) -> Self {
        Self { stats }
    }

    pub async fn release(
        &self,
        store: &dyn LockStore,
        shard: usize,
        key: &str,
        token: &str,
    ) -> Result<ReleaseStatus> {
        let deleted = match store.compare_and_delete(key, token).await {
            Ok(deleted) => deleted,
            Err(e) => {
                let err = LockError::StoreCommand(e);
                error!(shard, key = %key, kind = err.kind(), error = %err, "Lock release failed");
                self.stats.record_failure(Operation::Release, &err);
                return Err(err);
            }
        };

        if deleted {
            debug!(shard, key = %key, "Lock released");
            self.stats.record_released();
            Ok(ReleaseStatus::Released)
        } else {
            debug!(shard, key = %key, "Lock already released or taken over");
            self.stats.record_already_released();
            Ok(ReleaseStatus::AlreadyReleased)
        }
    }
}

/// Capability to release one acquired lock.
///
/// Dropping the guard does not release the lock; it expires with its lease.
pub struct LockGuard {
    shard: usize,
    key: String,
    token: String,
    store: Arc<dyn LockStore>,
    engine: Arc<ReleaseEngine>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("shard", &self.shard)
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl LockGuard {
    pub(crate) fn new(
        shard: usize,
        key: String,
        token: String,
        store: Arc<dyn LockStore>,
        engine: Arc<ReleaseEngine>,
    ) -> Self {
        Self {
            shard,
            key,
            token,
            store,
            engine,
        }
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Store key the lock was written under
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lock if it is still held with this guard's token.
    /// Calling it more than once reports `AlreadyReleased`.
    pub async fn unlock(&self) -> Result<ReleaseStatus> {
        self.engine
            .release(self.store.as_ref(), self.shard, &self.key, &self.token)
            .await
    }
}
