//! Lock manager configuration
//!
//! Options can be built in code or loaded with the `config` crate from an
//! optional file layered under `LOCKMAN__*` environment variables, e.g.
//! `LOCKMAN__RETRY=5` or `LOCKMAN__KEY_PREFIX=orders#`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{LockError, Result};

pub const DEFAULT_INTERVAL_MS: u64 = 100;
pub const DEFAULT_EXPIRY_MS: u64 = 10_000;
pub const DEFAULT_KEY_PREFIX: &str = "LOCKMAN#";
pub const DEFAULT_VALUE_LENGTH: usize = 12;
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 1_000;

/// Store sets larger than this cannot be addressed by a single hash byte.
pub const MAX_SHARDS: usize = 256;

const ENV_PREFIX: &str = "LOCKMAN";

/// Connection options applied to a master resolved through sentinels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct MasterOptions {
    #[serde(default)]
    pub db: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Describes a store the manager builds and connects itself.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreDescriptor {
    /// A single server reached directly, e.g. `redis://10.0.0.5:6379/0`
    Url { url: String },
    /// A master discovered through a set of sentinels
    Sentinel {
        endpoints: Vec<String>,
        master_name: String,
        #[serde(default)]
        options: MasterOptions,
    },
}

/// Configuration for the lock manager
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Maximum number of retries on contention (`None` = retry forever)
    pub retry: Option<u32>,
    /// Delay between attempts in milliseconds
    pub interval: u64,
    /// Default lease length in milliseconds
    pub expiry: u64,
    /// Lease length overrides per logical key
    pub expiry_of_key: HashMap<String, u64>,
    pub key_prefix: String,
    pub value_prefix: Option<String>,
    /// Number of random hex characters in a lock token
    pub value_length: usize,
    /// How long setup waits for self-built stores to become active
    pub ready_timeout: u64,
    /// Health probe period for self-built stores
    pub probe_interval: u64,
    /// Stores built by the manager; empty when handles are supplied directly
    pub stores: Vec<StoreDescriptor>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry: None,
            interval: DEFAULT_INTERVAL_MS,
            expiry: DEFAULT_EXPIRY_MS,
            expiry_of_key: HashMap::new(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            value_prefix: None,
            value_length: DEFAULT_VALUE_LENGTH,
            ready_timeout: DEFAULT_READY_TIMEOUT_MS,
            probe_interval: DEFAULT_PROBE_INTERVAL_MS,
            stores: Vec::new(),
        }
    }
}

impl LockConfig {
    /// Load configuration from an optional file, then `LOCKMAN__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(env);

        let config: LockConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_interval(mut self, interval_ms: u64) -> Self {
        self.interval = interval_ms;
        self
    }

    pub fn with_expiry(mut self, expiry_ms: u64) -> Self {
        self.expiry = expiry_ms;
        self
    }

    pub fn with_expiry_of_key(mut self, key: &str, expiry_ms: u64) -> Self {
        self.expiry_of_key.insert(key.to_string(), expiry_ms);
        self
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    pub fn with_value_prefix(mut self, prefix: &str) -> Self {
        self.value_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_value_length(mut self, length: usize) -> Self {
        self.value_length = length;
        self
    }

    pub fn with_stores(mut self, stores: Vec<StoreDescriptor>) -> Self {
        self.stores = stores;
        self
    }

    /// Lease length for a logical key. The same value drives the store TTL
    /// and the post-anomaly blocking window.
    pub fn expiry_for(&self, key: &str) -> Duration {
        let ms = self
            .expiry_of_key
            .get(key)
            .copied()
            .unwrap_or(self.expiry);
        Duration::from_millis(ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval)
    }

    /// Check option ranges. Store-set size is checked separately because
    /// pre-built handles are not part of the serialized configuration.
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(LockError::Config("interval must be positive".to_string()));
        }
        if self.expiry == 0 {
            return Err(LockError::Config("expiry must be positive".to_string()));
        }
        if let Some((key, _)) = self.expiry_of_key.iter().find(|(_, ms)| **ms == 0) {
            return Err(LockError::Config(format!(
                "expiry_of_key['{}'] must be positive",
                key
            )));
        }
        if self.value_length == 0 {
            return Err(LockError::Config(
                "value_length must be positive".to_string(),
            ));
        }
        for descriptor in &self.stores {
            if let StoreDescriptor::Sentinel {
                endpoints,
                master_name,
                ..
            } = descriptor
            {
                if endpoints.is_empty() {
                    return Err(LockError::Config(format!(
                        "sentinel store '{}' has no endpoints",
                        master_name
                    )));
                }
                if master_name.is_empty() {
                    return Err(LockError::Config(
                        "sentinel master name must not be empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

/// Store sets must hold between 1 and [`MAX_SHARDS`] handles.
pub fn validate_store_count(count: usize) -> Result<()> {
    if count == 0 || count > MAX_SHARDS {
        return Err(LockError::Config(format!(
            "store count must be between 1 and {}, got {}",
            MAX_SHARDS, count
        )));
    }
    Ok(())
}
