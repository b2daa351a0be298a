//! Per-shard connection health
//!
//! Each shard carries a status and the time of its most recent anomaly
//! (disconnect or failover). State is held in atomics so readers on the
//! acquisition path never wait on the event listeners that write it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::store::StoreEvent;

/// Connection status of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// No connectivity event seen yet
    Uninitialized,
    /// Connected and ready for commands
    Active,
    /// Connection ended
    Down,
    /// The store is promoting a replacement master
    Failover,
    /// An unrecognized status was reported
    Unknown,
}

const STATUS_UNINITIALIZED: u8 = 0;
const STATUS_ACTIVE: u8 = 1;
const STATUS_DOWN: u8 = 2;
const STATUS_FAILOVER: u8 = 3;
const STATUS_UNKNOWN: u8 = 4;

impl ShardStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            STATUS_ACTIVE => ShardStatus::Active,
            STATUS_DOWN => ShardStatus::Down,
            STATUS_FAILOVER => ShardStatus::Failover,
            STATUS_UNKNOWN => ShardStatus::Unknown,
            _ => ShardStatus::Uninitialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ShardStatus::Uninitialized => STATUS_UNINITIALIZED,
            ShardStatus::Active => STATUS_ACTIVE,
            ShardStatus::Down => STATUS_DOWN,
            ShardStatus::Failover => STATUS_FAILOVER,
            ShardStatus::Unknown => STATUS_UNKNOWN,
        }
    }

    /// Map a raw status code reported by a store adapter.
    pub fn from_code(code: &str) -> Self {
        match code {
            "connect" | "ready" => ShardStatus::Active,
            "end" => ShardStatus::Down,
            "failover-start" => ShardStatus::Failover,
            _ => ShardStatus::Unknown,
        }
    }

    /// Whether entering this status marks an anomaly.
    fn is_anomaly(self) -> bool {
        matches!(self, ShardStatus::Down | ShardStatus::Failover)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Uninitialized => "uninitialized",
            ShardStatus::Active => "active",
            ShardStatus::Down => "down",
            ShardStatus::Failover => "failover",
            ShardStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health record of one shard.
#[derive(Debug)]
struct ShardHealth {
    status: AtomicU8,
    /// Milliseconds since the tracker origin plus one; 0 = no anomaly yet
    last_anomaly: AtomicU64,
}

impl Default for ShardHealth {
    fn default() -> Self {
        Self {
            status: AtomicU8::new(STATUS_UNINITIALIZED),
            last_anomaly: AtomicU64::new(0),
        }
    }
}

/// Point-in-time view of a shard's health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub status: ShardStatus,
    pub last_anomaly: Option<Instant>,
}

/// Tracks health for every shard of a store set.
#[derive(Debug)]
pub struct HealthTracker {
    origin: Instant,
    shards: DashMap<usize, Arc<ShardHealth>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            shards: DashMap::new(),
        }
    }

    fn shard(&self, shard: usize) -> Arc<ShardHealth> {
        if let Some(health) = self.shards.get(&shard) {
            return health.clone();
        }
        self.shards.entry(shard).or_default().clone()
    }

    /// Record a status transition for a shard.
    pub fn update(&self, shard: usize, status: ShardStatus) {
        let health = self.shard(shard);
        let previous = ShardStatus::from_u8(health.status.swap(status.as_u8(), Ordering::SeqCst));

        if status.is_anomaly() {
            let elapsed = Instant::now().saturating_duration_since(self.origin);
            // round up so the window never ends before a lease written this millisecond
            let stamp = elapsed.as_micros().div_ceil(1000) as u64 + 1;
            // never move backwards, even for a stale event
            health.last_anomaly.fetch_max(stamp, Ordering::SeqCst);
            warn!(shard, from = %previous, to = %status, "Shard anomaly recorded");
        } else if previous != status {
            info!(shard, from = %previous, to = %status, "Shard status changed");
        }
    }

    /// Record a raw status code; unrecognized codes become `Unknown`.
    pub fn update_code(&self, shard: usize, code: &str) {
        self.update(shard, ShardStatus::from_code(code));
    }

    /// Feed a connectivity event. Only connect, end and failover-start
    /// change state; the rest are logged.
    pub fn on_event(&self, shard: usize, event: &StoreEvent) {
        match event {
            StoreEvent::Connect => self.update(shard, ShardStatus::Active),
            StoreEvent::End => self.update(shard, ShardStatus::Down),
            StoreEvent::FailoverStart => self.update(shard, ShardStatus::Failover),
            StoreEvent::Status(code) => self.update_code(shard, code),
            StoreEvent::Error(message) => {
                warn!(shard, error = %message, "Store reported an error");
            }
            StoreEvent::FailoverEnd => {
                info!(shard, "Store failover finished");
            }
            StoreEvent::SwitchMaster { master } => {
                info!(shard, master = %master, "Store switched master");
            }
            StoreEvent::SentinelConnect { endpoint } => {
                debug!(shard, endpoint = %endpoint, "Sentinel connected");
            }
            StoreEvent::SentinelDisconnect { endpoint } => {
                debug!(shard, endpoint = %endpoint, "Sentinel disconnected");
            }
        }
    }

    pub fn status_of(&self, shard: usize) -> ShardStatus {
        self.shards
            .get(&shard)
            .map(|h| ShardStatus::from_u8(h.status.load(Ordering::SeqCst)))
            .unwrap_or(ShardStatus::Uninitialized)
    }

    pub fn last_anomaly(&self, shard: usize) -> Option<Instant> {
        let stamp = self
            .shards
            .get(&shard)
            .map(|h| h.last_anomaly.load(Ordering::SeqCst))
            .unwrap_or(0);
        if stamp == 0 {
            return None;
        }
        Some(self.origin + Duration::from_millis(stamp - 1))
    }

    pub fn snapshot(&self, shard: usize) -> HealthSnapshot {
        HealthSnapshot {
            status: self.status_of(shard),
            last_anomaly: self.last_anomaly(shard),
        }
    }
}
