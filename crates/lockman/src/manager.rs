//! Lock manager
//!
//! Owns the configuration, the shard set and the health tracker. One
//! listener task per shard turns store events into health transitions for
//! as long as the manager lives.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::acquire::{AcquisitionEngine, LockRequest};
use crate::config::{LockConfig, validate_store_count};
use crate::error::{LockError, Result};
use crate::health::{HealthSnapshot, HealthTracker, ShardStatus};
use crate::key::SubKey;
use crate::release::{LockGuard, ReleaseEngine};
use crate::stats::{LockStats, LockStatsCollector};
use crate::store::{LockStore, StoreEvent};

/// Poll period while waiting for shards to come up
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct LockManager {
    config: Arc<LockConfig>,
    stores: Arc<[Arc<dyn LockStore>]>,
    health: Arc<HealthTracker>,
    acquisition: AcquisitionEngine,
    stats: Arc<LockStatsCollector>,
    listeners: Vec<JoinHandle<()>>,
}

impl LockManager {
    /// Build stores from `config.stores`, then wait until every shard is
    /// active or `ready_timeout` passes.
    pub async fn setup(config: LockConfig) -> Result<Self> {
        config.validate()?;
        validate_store_count(config.stores.len())?;

        let stores = build_stores(&config)?;
        let manager = Self::attach(config, stores)?;
        manager.wait_until_active(manager.config.ready_timeout()).await?;
        Ok(manager)
    }

    /// Attach already-connected store handles, one per shard.
    pub async fn with_stores(config: LockConfig, stores: Vec<Arc<dyn LockStore>>) -> Result<Self> {
        config.validate()?;
        validate_store_count(stores.len())?;
        Self::attach(config, stores)
    }

    fn attach(config: LockConfig, stores: Vec<Arc<dyn LockStore>>) -> Result<Self> {
        let config = Arc::new(config);
        let stores: Arc<[Arc<dyn LockStore>]> = Arc::from(stores);
        let health = Arc::new(HealthTracker::new());
        let stats = Arc::new(LockStatsCollector::default());

        let listeners = stores
            .iter()
            .enumerate()
            .map(|(shard, store)| {
                // subscribe before reading the flag so no transition is missed
                let events = store.subscribe();
                if store.is_connected() {
                    health.update(shard, ShardStatus::Active);
                }
                spawn_listener(shard, store.clone(), events, health.clone())
            })
            .collect();

        let release = Arc::new(ReleaseEngine::new(stats.clone()));
        let acquisition = AcquisitionEngine::new(
            config.clone(),
            stores.clone(),
            health.clone(),
            release,
            stats.clone(),
        );

        info!(shards = stores.len(), "Lock manager attached");

        Ok(Self {
            config,
            stores,
            health,
            acquisition,
            stats,
            listeners,
        })
    }

    /// Wait until every shard reports `active`.
    pub async fn wait_until_active(&self, timeout: Duration) -> Result<()> {
        let all_active = async {
            loop {
                if self.inactive_shards().is_empty() {
                    return;
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };

        if tokio::time::timeout(timeout, all_active).await.is_err() {
            let pending = self.inactive_shards();
            warn!(?pending, "Lock stores did not become active in time");
            return Err(LockError::Config(format!(
                "shards {:?} not active after {}ms",
                pending,
                timeout.as_millis()
            )));
        }
        info!(shards = self.stores.len(), "All lock stores active");
        Ok(())
    }

    fn inactive_shards(&self) -> Vec<usize> {
        (0..self.stores.len())
            .filter(|shard| self.health.status_of(*shard) != ShardStatus::Active)
            .collect()
    }

    /// Acquire a lock. The returned guard releases it with `unlock()`.
    pub async fn lock(&self, request: LockRequest) -> Result<LockGuard> {
        self.acquisition.acquire(&request).await
    }

    /// Remaining post-anomaly ban for the shard owning `key`/`sub_key`.
    pub fn blocking_time(&self, key: &str, sub_key: Option<&SubKey>) -> Result<Duration> {
        self.acquisition.blocking().blocking_time(key, sub_key)
    }

    /// Store key for `key`/`sub_key`.
    pub fn store_key(&self, key: &str, sub_key: Option<&SubKey>) -> Result<String> {
        self.acquisition.codec().build_key(key, sub_key)
    }

    /// Shard owning `key`/`sub_key`.
    pub fn route(&self, key: &str, sub_key: Option<&SubKey>) -> Result<usize> {
        let store_key = self.store_key(key, sub_key)?;
        Ok(self.acquisition.router().route(&store_key))
    }

    pub fn status_of(&self, shard: usize) -> ShardStatus {
        self.health.status_of(shard)
    }

    pub fn health_of(&self, shard: usize) -> HealthSnapshot {
        self.health.snapshot(shard)
    }

    pub fn shard_count(&self) -> usize {
        self.stores.len()
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn stats(&self) -> LockStats {
        self.stats.snapshot()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

fn spawn_listener(
    shard: usize,
    store: Arc<dyn LockStore>,
    mut events: tokio::sync::broadcast::Receiver<StoreEvent>,
    health: Arc<HealthTracker>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => health.on_event(shard, &event),
                Err(RecvError::Lagged(skipped)) => {
                    // a dropped event may have been end or failover-start
                    warn!(shard, skipped, "Store event listener lagged, assuming an anomaly");
                    health.update(shard, ShardStatus::Down);
                    if store.is_connected() {
                        health.update(shard, ShardStatus::Active);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(feature = "redis")]
fn build_stores(config: &LockConfig) -> Result<Vec<Arc<dyn LockStore>>> {
    use crate::store::RedisStore;

    config
        .stores
        .iter()
        .map(|descriptor| {
            RedisStore::from_descriptor(descriptor, config.probe_interval())
                .map(|store| Arc::new(store) as Arc<dyn LockStore>)
                .map_err(|e| LockError::Config(e.to_string()))
        })
        .collect()
}

#[cfg(not(feature = "redis"))]
fn build_stores(_config: &LockConfig) -> Result<Vec<Arc<dyn LockStore>>> {
    Err(LockError::Config(
        "building stores from descriptors requires the `redis` feature".to_string(),
    ))
}
