//! Store handles the lock manager talks to
//!
//! A store executes two atomic primitives, set-if-absent with expiry and
//! compare-and-delete, and publishes connectivity events that feed the
//! shard health tracker.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Capacity of each store's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connectivity lifecycle events emitted by a store handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Connection established and ready
    Connect,
    /// Connection ended
    End,
    /// A non-fatal error was observed on the connection
    Error(String),
    /// A replacement master is being promoted
    FailoverStart,
    /// Promotion finished
    FailoverEnd,
    /// Commands are now routed to a different master
    SwitchMaster { master: String },
    SentinelConnect { endpoint: String },
    SentinelDisconnect { endpoint: String },
    /// A raw status code with no dedicated event
    Status(String),
}

/// An already-connected key-value store holding lock entries.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `token` with a TTL, only if `key` does not exist.
    /// Returns `true` if the key was set.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Delete `key` only if it currently holds `token`, atomically.
    /// Returns `true` if the key was deleted.
    async fn compare_and_delete(&self, key: &str, token: &str) -> anyhow::Result<bool>;

    /// Whether the handle is connected right now.
    fn is_connected(&self) -> bool;

    /// Subscribe to connectivity events.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
