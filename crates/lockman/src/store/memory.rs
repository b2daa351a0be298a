//! In-process store with lease expiry
//!
//! Entries live in a `DashMap` and expire on tokio's clock, so tests running
//! with a paused clock can fast-forward leases. Connectivity events and
//! command failures can be injected to exercise the health-aware paths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::{EVENT_CHANNEL_CAPACITY, LockStore, StoreEvent};

/// Expired entries are swept once every this many inserts.
const SWEEP_EVERY: u64 = 256;

#[derive(Debug)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory lock store
pub struct MemoryStore {
    entries: DashMap<String, LockEntry>,
    inserts: AtomicU64,
    connected: AtomicBool,
    failing: AtomicBool,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A connected store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            inserts: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            events,
        }
    }

    /// A store that has not connected yet; send [`StoreEvent::Connect`]
    /// through [`MemoryStore::emit`] to bring it up.
    pub fn disconnected() -> Self {
        let store = Self::new();
        store.connected.store(false, Ordering::SeqCst);
        store
    }

    /// Publish a connectivity event, updating the connected flag for
    /// connect / end.
    pub fn emit(&self, event: StoreEvent) {
        match event {
            StoreEvent::Connect => self.connected.store(true, Ordering::SeqCst),
            StoreEvent::End => self.connected.store(false, Ordering::SeqCst),
            _ => {}
        }
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Make every command fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Current token stored at `key`, if it has not expired.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.token.clone())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("injected store failure");
        }
        if !self.connected.load(Ordering::SeqCst) {
            anyhow::bail!("connection is closed");
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        self.check_available()?;

        let entry = LockEntry {
            token: token.to_string(),
            expires_at: Instant::now() + ttl,
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired() {
                    return Ok(false);
                }
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        debug!(key = %key, "Memory store entry set");

        // entry guard is released above; retain would deadlock on it
        if (self.inserts.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.purge_expired();
        }
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> anyhow::Result<bool> {
        self.check_available()?;

        // an expired entry is dropped whatever its token
        let mut removed = false;
        self.entries.remove_if(key, |_, entry| {
            let expired = entry.is_expired();
            removed = !expired && entry.token == token;
            removed || expired
        });
        if removed {
            debug!(key = %key, "Memory store entry deleted");
        }
        Ok(removed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
