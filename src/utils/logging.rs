//! Logging setup
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter`, a stdout
//! layer in the configured format and, optionally, a second layer writing
//! plain text to a log file.
//!
//! Audit records are emitted with `target: "audit"`; filter them with
//! `RUST_LOG=audit=info` or route them with a dedicated layer.

use std::fs::File;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};

/// Target used for file transfer audit records
pub const AUDIT_TARGET: &str = "audit";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Default filter when `RUST_LOG` is not set
pub fn default_filter(level: &str) -> String {
    format!(
        "lamco_cliprdr_files={level},{audit}=info,fuser=warn,warn",
        level = level,
        audit = AUDIT_TARGET
    )
}

fn stdout_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stdout)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(std::io::stdout)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, file: File) -> BoxedLayer {
    let writer = Arc::new(file);
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .boxed(),
        LogFormat::Compact | LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .boxed(),
    }
}

/// Initialize the global tracing subscriber
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.level.to_lowercase())));

    let mut layers = vec![stdout_layer(config.format)];
    if let Some(path) = &config.log_file {
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file: {}", path.display()))?;
        layers.push(file_layer(config.format, file));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("Logging is already initialized")?;

    if let Some(path) = &config.log_file {
        info!("Logging to file: {}", path.display());
    }
    Ok(())
}
