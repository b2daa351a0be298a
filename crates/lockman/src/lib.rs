//! Lockman - sharded, lease-based distributed locks
//!
//! This crate provides:
//! - Store key and ownership token construction
//! - Deterministic key-to-shard routing over up to 256 stores
//! - Per-shard health tracking fed by store connectivity events
//! - A post-anomaly blocking window that refuses unsafe acquisitions
//! - Retrying acquisition (`SET NX PX`) and token-checked atomic release
//! - In-memory and Redis (feature `redis`) store implementations
//!
//! ```ignore
//! let manager = LockManager::setup(LockConfig::load(Some(path))?).await?;
//! let guard = manager.lock(LockRequest::new("orders").sub_key(["eu", "42"])).await?;
//! // ... critical section ...
//! guard.unlock().await?;
//! ```

pub mod acquire;
pub mod blocking;
pub mod config;
pub mod error;
pub mod health;
pub mod key;
pub mod manager;
pub mod release;
pub mod router;
pub mod stats;
pub mod store;

pub use acquire::{AcquisitionEngine, LockRequest};
pub use blocking::BlockingPolicy;
pub use config::{LockConfig, MasterOptions, StoreDescriptor};
pub use error::{LockError, Result};
pub use health::{HealthSnapshot, HealthTracker, ShardStatus};
pub use key::{KeyCodec, SubKey};
pub use manager::LockManager;
pub use release::{LockGuard, ReleaseEngine, ReleaseStatus};
pub use router::ShardRouter;
pub use stats::LockStats;
pub use store::{LockStore, MemoryStore, StoreEvent};

#[cfg(feature = "redis")]
pub use store::RedisStore;
