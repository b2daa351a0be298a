//! Post-anomaly acquisition ban
//!
//! A lock written just before a shard dropped or failed over may still be
//! live once the shard is reachable again. New acquisitions on that shard
//! are refused until one lease period has passed since the anomaly, after
//! which any earlier lock has expired through the store's own TTL.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::LockConfig;
use crate::error::Result;
use crate::health::HealthTracker;
use crate::key::{KeyCodec, SubKey};
use crate::router::ShardRouter;

pub struct BlockingPolicy {
    config: Arc<LockConfig>,
    codec: KeyCodec,
    router: ShardRouter,
    health: Arc<HealthTracker>,
}

impl BlockingPolicy {
    pub fn new(
        config: Arc<LockConfig>,
        router: ShardRouter,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            codec: KeyCodec::from_config(&config),
            config,
            router,
            health,
        }
    }

    /// Remaining ban for the shard owning `key`/`sub_key`; zero when free.
    pub fn blocking_time(&self, key: &str, sub_key: Option<&SubKey>) -> Result<Duration> {
        let store_key = self.codec.build_key(key, sub_key)?;
        let shard = self.router.route(&store_key);
        Ok(self.shard_blocking_time(shard, key))
    }

    /// Remaining ban for `shard`, using the lease length of logical `key`.
    pub fn shard_blocking_time(&self, shard: usize, key: &str) -> Duration {
        let Some(last_anomaly) = self.health.last_anomaly(shard) else {
            return Duration::ZERO;
        };
        let window_end = last_anomaly + self.config.expiry_for(key);
        window_end.saturating_duration_since(Instant::now())
    }
}
