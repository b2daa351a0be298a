//! Console logging setup
//!
//! `RUST_LOG` takes precedence over the `--log-level` flag when set.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// Include file and line in each record
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            verbose: false,
        }
    }
}

impl LoggingConfig {
    pub fn from_args(level: Option<&str>, verbose: bool) -> Self {
        let level = level
            .and_then(|v| v.parse().ok())
            .unwrap_or(if verbose { Level::DEBUG } else { Level::INFO });
        Self { level, verbose }
    }
}

/// Install the global subscriber. Records go to stderr so command output on
/// stdout stays machine readable.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(config.verbose)
        .with_line_number(config.verbose)
        .with_filter(filter);

    Registry::default()
        .with(console_layer)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;
    Ok(())
}
