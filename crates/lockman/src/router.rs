//! Deterministic store-key to shard mapping

use md5::{Digest, Md5};

/// Maps store keys onto a fixed number of shards.
///
/// The owning shard is the low byte of the key's MD5 digest modulo the shard
/// count, so the lock and the unlock for one key always reach the same
/// store. Changing the shard count reshuffles ownership.
#[derive(Debug, Clone, Copy)]
pub struct ShardRouter {
    shard_count: usize,
}

impl ShardRouter {
    pub fn new(shard_count: usize) -> Self {
        Self { shard_count }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn route(&self, store_key: &str) -> usize {
        if self.shard_count == 0 {
            return 0;
        }
        let digest = Md5::digest(store_key.as_bytes());
        let low_byte = digest[digest.len() - 1];
        low_byte as usize % self.shard_count
    }
}
