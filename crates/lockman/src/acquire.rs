//! Lock acquisition with bounded retries
//!
//! One request runs: readiness check → blocking check → `SET NX PX`. On
//! contention it waits `interval` and tries again until the retry budget is
//! spent. Readiness, blocking and store failures end the request at once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::blocking::BlockingPolicy;
use crate::config::LockConfig;
use crate::error::{LockError, Result};
use crate::health::{HealthTracker, ShardStatus};
use crate::key::{KeyCodec, SubKey};
use crate::release::{LockGuard, ReleaseEngine};
use crate::router::ShardRouter;
use crate::stats::{LockStatsCollector, Operation};
use crate::store::LockStore;

/// A request for one lock
#[derive(Debug, Clone)]
pub struct LockRequest {
    key: String,
    sub_key: Option<SubKey>,
    retry: Option<u32>,
    interval: Option<Duration>,
}

impl LockRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            sub_key: None,
            retry: None,
            interval: None,
        }
    }

    pub fn sub_key(mut self, sub_key: impl Into<SubKey>) -> Self {
        self.sub_key = Some(sub_key.into());
        self
    }

    /// Override the configured retry count for this request.
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Override the configured delay between attempts for this request.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

}

pub struct AcquisitionEngine {
    config: Arc<LockConfig>,
    codec: KeyCodec,
    router: ShardRouter,
    stores: Arc<[Arc<dyn LockStore>]>,
    health: Arc<HealthTracker>,
    blocking: BlockingPolicy,
    release: Arc<ReleaseEngine>,
    stats: Arc<LockStatsCollector>,
}

impl AcquisitionEngine {
    pub(crate) fn new(
        config: Arc<LockConfig>,
        stores: Arc<[Arc<dyn LockStore>]>,
        health: Arc<HealthTracker>,
        release: Arc<ReleaseEngine>,
        stats: Arc<LockStatsCollector>,
    ) -> Self {
        let router = ShardRouter::new(stores.len());
        Self {
            codec: KeyCodec::from_config(&config),
            blocking: BlockingPolicy::new(config.clone(), router, health.clone()),
            config,
            router,
            stores,
            health,
            release,
            stats,
        }
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn blocking(&self) -> &BlockingPolicy {
        &self.blocking
    }

    pub async fn acquire(&self, request: &LockRequest) -> Result<LockGuard> {
        if request.interval.is_some_and(|interval| interval.is_zero()) {
            return Err(self.fail(LockError::InvalidArgument(
                "retry interval must be positive".to_string(),
            )));
        }
        let store_key = self
            .codec
            .build_key(&request.key, request.sub_key.as_ref())
            .map_err(|e| self.fail(e))?;
        let shard = self.router.route(&store_key);
        // one token for the whole attempt cycle
        let token = self.codec.build_token();
        let ttl = self.config.expiry_for(&request.key);
        let retry = request.retry.or(self.config.retry);
        let interval = request.interval.unwrap_or_else(|| self.config.interval());

        let mut attempts: u32 = 0;
        loop {
            let store = match self.stores.get(shard) {
                Some(store) if self.health.status_of(shard) != ShardStatus::Uninitialized => store,
                _ => {
                    let err = LockError::StoreUninitialized { shard };
                    warn!(shard, key = %store_key, kind = err.kind(), "Lock store not initialized");
                    return Err(self.fail(err));
                }
            };

            let remaining = self.blocking.shard_blocking_time(shard, &request.key);
            if !remaining.is_zero() {
                let err = LockError::Blocked { shard, remaining };
                debug!(
                    shard,
                    key = %store_key,
                    kind = err.kind(),
                    remaining_ms = remaining.as_millis() as u64,
                    "Shard is blocked"
                );
                return Err(self.fail(err));
            }

            attempts = attempts.saturating_add(1);
            match store.set_if_absent(&store_key, &token, ttl).await {
                Ok(true) => {
                    debug!(shard, key = %store_key, attempts, "Lock acquired");
                    self.stats.record_acquired();
                    return Ok(LockGuard::new(
                        shard,
                        store_key,
                        token,
                        store.clone(),
                        self.release.clone(),
                    ));
                }
                Ok(false) => {
                    self.stats.record_contended();
                }
                Err(e) => {
                    let err = LockError::StoreCommand(e);
                    error!(
                        shard,
                        key = %store_key,
                        kind = err.kind(),
                        error = %err,
                        "Lock store command failed"
                    );
                    return Err(self.fail(err));
                }
            }

            // attempts = 1 + retries used so far
            if retry.is_some_and(|max| attempts > max) {
                let err = LockError::RetryExhausted {
                    key: store_key,
                    attempts,
                };
                debug!(shard, kind = err.kind(), attempts, "Lock retries exhausted");
                return Err(self.fail(err));
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn fail(&self, err: LockError) -> LockError {
        self.stats.record_failure(Operation::Acquire, &err);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreEvent};
    use tokio::time::Instant;

    struct Fixture {
        engine: AcquisitionEngine,
        store: Arc<MemoryStore>,
        health: Arc<HealthTracker>,
        stats: Arc<LockStatsCollector>,
    }

    fn fixture(config: LockConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let stores: Arc<[Arc<dyn LockStore>]> = Arc::from(vec![store.clone() as Arc<dyn LockStore>]);
        let health = Arc::new(HealthTracker::new());
        health.on_event(0, &StoreEvent::Connect);
        let stats = Arc::new(LockStatsCollector::default());
        let release = Arc::new(ReleaseEngine::new(stats.clone()));
        let engine = AcquisitionEngine::new(
            Arc::new(config),
            stores,
            health.clone(),
            release,
            stats.clone(),
        );
        Fixture {
            engine,
            store,
            health,
            stats,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_writes_token_with_ttl() {
        let f = fixture(LockConfig::default().with_expiry(1000));
        let guard = f.engine.acquire(&LockRequest::new("a")).await.unwrap();

        assert_eq!(guard.key(), "LOCKMAN#a");
        assert_eq!(guard.shard(), 0);
        assert_eq!(f.store.get("LOCKMAN#a").as_deref(), Some(guard.token()));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(f.store.get("LOCKMAN#a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_after_budget() {
        let f = fixture(LockConfig::default().with_retry(3).with_interval(100));
        let _held = f.engine.acquire(&LockRequest::new("a")).await.unwrap();

        let start = Instant::now();
        let err = f.engine.acquire(&LockRequest::new("a")).await.unwrap_err();
        match err {
            LockError::RetryExhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {:?}", other),
        }
        // three waits between four attempts
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
        assert_eq!(f.stats.snapshot().contended, 4);
        assert_eq!(f.stats.snapshot().exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_overrides_retry_and_interval() {
        let f = fixture(LockConfig::default().with_retry(10).with_interval(100));
        let _held = f.engine.acquire(&LockRequest::new("a")).await.unwrap();

        let start = Instant::now();
        let request = LockRequest::new("a")
            .retry(1)
            .interval(Duration::from_millis(40));
        let err = f.engine.acquire(&request).await.unwrap_err();
        assert!(matches!(err, LockError::RetryExhausted { attempts: 2, .. }));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retry_waits_for_expiry() {
        let f = fixture(LockConfig::default().with_expiry(500).with_interval(100));
        let first = f.engine.acquire(&LockRequest::new("a")).await.unwrap();

        let second = f.engine.acquire(&LockRequest::new("a")).await.unwrap();
        assert_ne!(first.token(), second.token());
        assert_eq!(f.store.get("LOCKMAN#a").as_deref(), Some(second.token()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uninitialized_shard_fails_fast() {
        let f = fixture(LockConfig::default());
        let health = HealthTracker::new();
        assert_eq!(health.status_of(0), ShardStatus::Uninitialized);

        let stores: Arc<[Arc<dyn LockStore>]> =
            Arc::from(vec![f.store.clone() as Arc<dyn LockStore>]);
        let stats = Arc::new(LockStatsCollector::default());
        let engine = AcquisitionEngine::new(
            Arc::new(LockConfig::default().with_retry(5)),
            stores,
            Arc::new(health),
            Arc::new(ReleaseEngine::new(stats.clone())),
            stats.clone(),
        );

        let err = engine.acquire(&LockRequest::new("a")).await.unwrap_err();
        assert!(matches!(err, LockError::StoreUninitialized { shard: 0 }));
        assert!(f.store.is_empty());
        assert_eq!(stats.snapshot().uninitialized, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_after_anomaly() {
        let f = fixture(LockConfig::default().with_expiry(1000).with_retry(5));
        f.health.on_event(0, &StoreEvent::End);
        f.health.on_event(0, &StoreEvent::Connect);

        let err = f.engine.acquire(&LockRequest::new("a")).await.unwrap_err();
        match err {
            LockError::Blocked { shard, remaining } => {
                assert_eq!(shard, 0);
                assert_eq!(remaining, Duration::from_millis(1000));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(f.store.is_empty());

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(f.engine.acquire(&LockRequest::new("a")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_error_not_retried() {
        let f = fixture(LockConfig::default().with_retry(5));
        f.store.set_failing(true);

        let start = Instant::now();
        let err = f.engine.acquire(&LockRequest::new("a")).await.unwrap_err();
        assert!(matches!(err, LockError::StoreCommand(_)));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(f.stats.snapshot().store_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_override_rejected() {
        let f = fixture(LockConfig::default());
        let _held = f.engine.acquire(&LockRequest::new("a")).await.unwrap();

        let request = LockRequest::new("a").interval(Duration::ZERO);
        let err = f.engine.acquire(&request).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));
        assert_eq!(f.stats.snapshot().contended, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_key() {
        let f = fixture(LockConfig::default());
        let err = f.engine.acquire(&LockRequest::new("")).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));
    }
}
