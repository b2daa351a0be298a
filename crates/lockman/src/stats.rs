//! Lock outcome counters
//!
//! Every outcome is counted locally and published through the `metrics`
//! facade, so hosts with a recorder installed get the same numbers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::LockError;

const ACQUIRE_METRIC: &str = "lockman_acquire_total";
const RELEASE_METRIC: &str = "lockman_release_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Acquire,
    Release,
}

impl Operation {
    fn metric(self) -> &'static str {
        match self {
            Operation::Acquire => ACQUIRE_METRIC,
            Operation::Release => RELEASE_METRIC,
        }
    }
}

/// Snapshot of lock statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    /// Successful acquisitions
    pub acquired: u64,
    /// Attempts that found the key already held
    pub contended: u64,
    /// Requests refused by the post-anomaly window
    pub blocked: u64,
    /// Requests that ran out of retries
    pub exhausted: u64,
    /// Requests against a shard that never became ready
    pub uninitialized: u64,
    /// Store command failures while acquiring or releasing
    pub store_errors: u64,
    pub released: u64,
    /// Releases that found the lock expired or taken over
    pub already_released: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LockStatsCollector {
    acquired: AtomicU64,
    contended: AtomicU64,
    blocked: AtomicU64,
    exhausted: AtomicU64,
    uninitialized: AtomicU64,
    store_errors: AtomicU64,
    released: AtomicU64,
    already_released: AtomicU64,
}

impl LockStatsCollector {
    pub(crate) fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(ACQUIRE_METRIC, "outcome" => "acquired").increment(1);
    }

    pub(crate) fn record_contended(&self) {
        self.contended.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(ACQUIRE_METRIC, "outcome" => "contended").increment(1);
    }

    /// Count a failed acquire or release under its error kind.
    pub(crate) fn record_failure(&self, operation: Operation, err: &LockError) {
        let counter = match err {
            LockError::Blocked { .. } => Some(&self.blocked),
            LockError::RetryExhausted { .. } => Some(&self.exhausted),
            LockError::StoreUninitialized { .. } => Some(&self.uninitialized),
            LockError::StoreCommand(_) => Some(&self.store_errors),
            LockError::Config(_) | LockError::InvalidArgument(_) => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!(operation.metric(), "outcome" => err.kind()).increment(1);
    }

    pub(crate) fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(RELEASE_METRIC, "outcome" => "released").increment(1);
    }

    pub(crate) fn record_already_released(&self) {
        self.already_released.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(RELEASE_METRIC, "outcome" => "already_released").increment(1);
    }

    pub(crate) fn snapshot(&self) -> LockStats {
        LockStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            uninitialized: self.uninitialized.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            already_released: self.already_released.load(Ordering::Relaxed),
        }
    }
}
