//! Error types for lock acquisition and release

use std::time::Duration;

/// Error type for lockman operations
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store for shard {shard} is not initialized")]
    StoreUninitialized { shard: usize },

    #[error("shard {shard} is blocked for another {}ms", .remaining.as_millis())]
    Blocked { shard: usize, remaining: Duration },

    #[error("lock '{key}' still held after {attempts} attempts")]
    RetryExhausted { key: String, attempts: u32 },

    #[error("store command failed: {0}")]
    StoreCommand(#[from] anyhow::Error),
}

impl From<config::ConfigError> for LockError {
    fn from(value: config::ConfigError) -> Self {
        LockError::Config(value.to_string())
    }
}

impl LockError {
    /// Short, stable label; the `outcome` label of failure metrics and the
    /// `kind` field of failure logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LockError::Config(_) => "config",
            LockError::InvalidArgument(_) => "invalid_argument",
            LockError::StoreUninitialized { .. } => "store_uninitialized",
            LockError::Blocked { .. } => "blocked",
            LockError::RetryExhausted { .. } => "retry_exhausted",
            LockError::StoreCommand(_) => "store_command",
        }
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
