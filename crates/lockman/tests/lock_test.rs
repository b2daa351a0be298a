//! Lockman lock lifecycle tests
//!
//! Drives a `LockManager` over in-memory stores with a paused clock, so
//! lease expiry and post-anomaly windows run deterministically.

use std::sync::Arc;
use std::time::Duration;

use lockman::{
    LockConfig, LockError, LockManager, LockRequest, LockStore, MemoryStore, ReleaseStatus,
    ShardStatus, StoreEvent, SubKey,
};

fn memory_stores(count: usize) -> Vec<Arc<MemoryStore>> {
    (0..count).map(|_| Arc::new(MemoryStore::new())).collect()
}

async fn manager(config: LockConfig, stores: &[Arc<MemoryStore>]) -> LockManager {
    let handles = stores
        .iter()
        .map(|store| store.clone() as Arc<dyn LockStore>)
        .collect();
    LockManager::with_stores(config, handles).await.unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ============== Acquire / Release ==============

#[tokio::test(start_paused = true)]
async fn test_lock_unlock_relock() {
    let stores = memory_stores(1);
    let manager = manager(LockConfig::default().with_retry(0), &stores).await;

    let guard = manager.lock(LockRequest::new("order")).await.unwrap();
    assert_eq!(guard.key(), "LOCKMAN#order");
    assert_eq!(guard.token().len(), 12);

    let err = manager.lock(LockRequest::new("order")).await.unwrap_err();
    assert!(matches!(err, LockError::RetryExhausted { attempts: 1, .. }));

    assert_eq!(guard.unlock().await.unwrap(), ReleaseStatus::Released);
    let again = manager.lock(LockRequest::new("order")).await.unwrap();
    assert_ne!(again.token(), guard.token());

    let stats = manager.stats();
    assert_eq!(stats.acquired, 2);
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.released, 1);
}

#[tokio::test(start_paused = true)]
async fn test_sub_key_parts_and_joined_string_contend() {
    let stores = memory_stores(4);
    let manager = manager(LockConfig::default().with_retry(0), &stores).await;

    let _held = manager
        .lock(LockRequest::new("user").sub_key(["x", "1"]))
        .await
        .unwrap();
    let err = manager
        .lock(LockRequest::new("user").sub_key("x-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::RetryExhausted { .. }));

    // different sub-key, different lock
    assert!(
        manager
            .lock(LockRequest::new("user").sub_key(["x", "2"]))
            .await
            .is_ok()
    );
}

#[tokio::test(start_paused = true)]
async fn test_value_prefix_on_tokens() {
    let stores = memory_stores(1);
    let config = LockConfig::default()
        .with_value_prefix("node-a:")
        .with_value_length(8);
    let manager = manager(config, &stores).await;

    let guard = manager.lock(LockRequest::new("job")).await.unwrap();
    assert!(guard.token().starts_with("node-a:"));
    assert_eq!(guard.token().len(), "node-a:".len() + 8);
    assert_eq!(stores[0].get("LOCKMAN#job").as_deref(), Some(guard.token()));
}

// ============== Leases ==============

#[tokio::test(start_paused = true)]
async fn test_stale_unlock_after_lease_expiry() {
    let stores = memory_stores(1);
    let manager = manager(
        LockConfig::default().with_expiry(1000).with_retry(0),
        &stores,
    )
    .await;

    let first = manager.lock(LockRequest::new("report")).await.unwrap();
    tokio::time::advance(Duration::from_millis(1001)).await;

    let second = manager.lock(LockRequest::new("report")).await.unwrap();
    let status = first.unlock().await.unwrap();
    assert!(status.already_released());

    // the new holder is untouched
    assert_eq!(
        stores[0].get("LOCKMAN#report").as_deref(),
        Some(second.token())
    );
    assert_eq!(second.unlock().await.unwrap(), ReleaseStatus::Released);
    assert_eq!(manager.stats().already_released, 1);
}

#[tokio::test(start_paused = true)]
async fn test_per_key_expiry_override() {
    let stores = memory_stores(1);
    let config = LockConfig::default()
        .with_expiry(10_000)
        .with_expiry_of_key("short", 200)
        .with_retry(0);
    let manager = manager(config, &stores).await;

    let _short = manager.lock(LockRequest::new("short")).await.unwrap();
    let _long = manager.lock(LockRequest::new("long")).await.unwrap();

    tokio::time::advance(Duration::from_millis(250)).await;
    assert!(stores[0].get("LOCKMAN#short").is_none());
    assert!(stores[0].get("LOCKMAN#long").is_some());
}

// ============== Failure handling ==============

#[tokio::test(start_paused = true)]
async fn test_blocking_window_after_reconnect() {
    let stores = memory_stores(1);
    let config = LockConfig::default()
        .with_expiry(1000)
        .with_expiry_of_key("fast", 300);
    let manager = manager(config, &stores).await;

    stores[0].emit(StoreEvent::End);
    settle().await;
    stores[0].emit(StoreEvent::Connect);
    settle().await;
    assert_eq!(manager.status_of(0), ShardStatus::Active);

    let remaining = manager.blocking_time("slow", None).unwrap();
    assert!(remaining > Duration::from_millis(900));
    assert!(remaining <= Duration::from_millis(1000));

    let err = manager.lock(LockRequest::new("slow")).await.unwrap_err();
    assert!(matches!(err, LockError::Blocked { shard: 0, .. }));
    assert!(stores[0].is_empty());

    // the override shortens the window as well as the lease
    tokio::time::advance(Duration::from_millis(300)).await;
    assert_eq!(
        manager.blocking_time("fast", None).unwrap(),
        Duration::ZERO
    );
    assert!(manager.lock(LockRequest::new("fast")).await.is_ok());
    assert!(manager.lock(LockRequest::new("slow")).await.is_err());

    tokio::time::advance(Duration::from_millis(700)).await;
    assert!(manager.lock(LockRequest::new("slow")).await.is_ok());
    assert_eq!(manager.stats().blocked, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failover_opens_window() {
    let stores = memory_stores(1);
    let manager = manager(LockConfig::default().with_expiry(500), &stores).await;

    stores[0].emit(StoreEvent::FailoverStart);
    settle().await;
    assert_eq!(manager.status_of(0), ShardStatus::Failover);
    assert!(matches!(
        manager.lock(LockRequest::new("a")).await,
        Err(LockError::Blocked { .. })
    ));

    tokio::time::advance(Duration::from_millis(500)).await;
    assert!(manager.lock(LockRequest::new("a")).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_uninitialized_shard_rejected() {
    let store = Arc::new(MemoryStore::disconnected());
    let manager = LockManager::with_stores(
        LockConfig::default(),
        vec![store.clone() as Arc<dyn LockStore>],
    )
    .await
    .unwrap();

    let err = manager.lock(LockRequest::new("a")).await.unwrap_err();
    assert!(matches!(err, LockError::StoreUninitialized { shard: 0 }));

    store.emit(StoreEvent::Connect);
    settle().await;
    assert!(manager.lock(LockRequest::new("a")).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_surfaces() {
    let stores = memory_stores(1);
    let manager = manager(LockConfig::default(), &stores).await;

    let guard = manager.lock(LockRequest::new("a")).await.unwrap();
    stores[0].set_failing(true);

    let err = guard.unlock().await.unwrap_err();
    assert!(matches!(err, LockError::StoreCommand(_)));
    assert!(matches!(
        manager.lock(LockRequest::new("b")).await,
        Err(LockError::StoreCommand(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_key_rejected() {
    let stores = memory_stores(1);
    let manager = manager(LockConfig::default(), &stores).await;
    assert!(matches!(
        manager.lock(LockRequest::new("")).await,
        Err(LockError::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.blocking_time("", None),
        Err(LockError::InvalidArgument(_))
    ));
}

// ============== Sharding ==============

#[tokio::test(start_paused = true)]
async fn test_lock_lands_on_routed_shard() {
    let stores = memory_stores(16);
    let manager = manager(LockConfig::default(), &stores).await;

    for i in 0..32 {
        let sub_key = SubKey::from(i);
        let shard = manager.route("tenant", Some(&sub_key)).unwrap();
        let guard = manager
            .lock(LockRequest::new("tenant").sub_key(i))
            .await
            .unwrap();

        assert_eq!(guard.shard(), shard);
        assert_eq!(stores[shard].get(guard.key()).as_deref(), Some(guard.token()));
        for (other, store) in stores.iter().enumerate() {
            if other != shard {
                assert!(store.get(guard.key()).is_none());
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_anomaly_is_per_shard() {
    let stores = memory_stores(16);
    let manager = manager(LockConfig::default(), &stores).await;

    let mut keys = (0..64).map(|i| format!("k{}", i));
    let first = keys.next().unwrap();
    let bad_shard = manager.route(&first, None).unwrap();
    let other = keys
        .find(|key| manager.route(key, None).unwrap() != bad_shard)
        .unwrap();

    stores[bad_shard].emit(StoreEvent::End);
    settle().await;

    assert!(matches!(
        manager.lock(LockRequest::new(first.as_str())).await,
        Err(LockError::Blocked { .. })
    ));
    assert!(manager.lock(LockRequest::new(other.as_str())).await.is_ok());
}

// ============== Concurrency ==============

#[tokio::test(start_paused = true)]
async fn test_single_winner_under_contention() {
    let stores = memory_stores(4);
    let manager = Arc::new(manager(LockConfig::default().with_retry(0), &stores).await);

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.lock(LockRequest::new("singleton")).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(LockError::RetryExhausted { .. }) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_take_turns() {
    let stores = memory_stores(1);
    let manager = Arc::new(
        manager(LockConfig::default().with_interval(10), &stores).await,
    );

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let guard = manager.lock(LockRequest::new("queue")).await?;
                tokio::time::sleep(Duration::from_millis(25)).await;
                guard.unlock().await
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), ReleaseStatus::Released);
    }
    assert!(stores[0].is_empty());
    assert_eq!(manager.stats().acquired, 5);
}
