//! Lockman command line tool.
//!
//! Routes keys, takes and releases locks, and reports shard health against
//! the stores named in a lockman configuration file, or against in-memory
//! stores with `--memory`.

mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use lockman::{
    KeyCodec, LockConfig, LockManager, LockRequest, LockStore, MemoryStore, ShardRouter, SubKey,
    config::validate_store_count,
};
use serde_json::json;
use tracing::info;

use logging::LoggingConfig;

#[derive(Debug, Parser)]
#[command(name = "lockman", version, about = "Sharded distributed lock tool")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long = "config", env = "LOCKMAN_CONFIG")]
    config: Option<PathBuf>,
    /// Use this many in-memory stores instead of the configured ones
    #[arg(long = "memory", value_name = "SHARDS")]
    memory: Option<usize>,
    #[arg(long = "log-level", env = "LOCKMAN_LOG_LEVEL")]
    log_level: Option<String>,
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the store key and owning shard of a lock
    Route {
        key: String,
        /// Sub-key part; repeat for multi-part sub-keys
        #[arg(short = 's', long = "sub-key")]
        sub_key: Vec<String>,
    },
    /// Acquire a lock, hold it, then release it
    Lock {
        key: String,
        #[arg(short = 's', long = "sub-key")]
        sub_key: Vec<String>,
        #[arg(long = "retry")]
        retry: Option<u32>,
        #[arg(long = "interval-ms")]
        interval_ms: Option<u64>,
        /// How long to hold the lock before releasing it
        #[arg(long = "hold-ms", default_value_t = 0)]
        hold_ms: u64,
    },
    /// Print per-shard health
    Status,
}

fn sub_key(parts: Vec<String>) -> Option<SubKey> {
    if parts.is_empty() {
        None
    } else {
        Some(SubKey::from(parts))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init_logging(&LoggingConfig::from_args(
        cli.log_level.as_deref(),
        cli.verbose,
    ))
    .map_err(|e| anyhow!("{}", e))?;

    let config = LockConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Route { key, sub_key: parts } => {
            let shard_count = cli.memory.unwrap_or(config.stores.len());
            validate_store_count(shard_count)?;

            let store_key = KeyCodec::from_config(&config).build_key(&key, sub_key(parts).as_ref())?;
            let shard = ShardRouter::new(shard_count).route(&store_key);
            println!(
                "{}",
                json!({ "key": store_key, "shard": shard, "shards": shard_count })
            );
        }
        Command::Lock {
            key,
            sub_key: parts,
            retry,
            interval_ms,
            hold_ms,
        } => {
            let manager = connect(config, cli.memory).await?;

            let mut request = LockRequest::new(key);
            if let Some(parts) = sub_key(parts) {
                request = request.sub_key(parts);
            }
            if let Some(retry) = retry {
                request = request.retry(retry);
            }
            if let Some(interval_ms) = interval_ms {
                request = request.interval(Duration::from_millis(interval_ms));
            }

            let guard = manager.lock(request).await?;
            info!(key = %guard.key(), shard = guard.shard(), hold_ms, "Holding lock");
            tokio::time::sleep(Duration::from_millis(hold_ms)).await;
            let status = guard.unlock().await?;

            println!(
                "{}",
                json!({
                    "key": guard.key(),
                    "shard": guard.shard(),
                    "token": guard.token(),
                    "already_released": status.already_released(),
                })
            );
        }
        Command::Status => {
            let manager = connect(config, cli.memory).await?;

            let shards: Vec<_> = (0..manager.shard_count())
                .map(|shard| {
                    let health = manager.health_of(shard);
                    json!({
                        "shard": shard,
                        "status": health.status.as_str(),
                        "last_anomaly_ms_ago": health
                            .last_anomaly
                            .map(|at| at.elapsed().as_millis() as u64),
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "key_prefix": manager.config().key_prefix,
                    "expiry_ms": manager.config().expiry,
                    "shards": shards,
                    "stats": manager.stats(),
                }))?
            );
        }
    }

    Ok(())
}

async fn connect(config: LockConfig, memory: Option<usize>) -> anyhow::Result<LockManager> {
    let manager = match memory {
        Some(count) => {
            let stores = (0..count)
                .map(|_| Arc::new(MemoryStore::new()) as Arc<dyn LockStore>)
                .collect();
            LockManager::with_stores(config, stores).await?
        }
        None => LockManager::setup(config).await?,
    };
    Ok(manager)
}
