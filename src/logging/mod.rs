//! Log subscriber setup
//!
//! Installs a `tracing-subscriber` fmt layer writing to stderr, so command
//! output on stdout stays clean. `RUST_LOG` wins over the configured level.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {filter:?}: {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("failed to install log subscriber: {0}")]
    Init(String),
}

/// Filter directive for the given config, `--verbose` raising it to debug.
pub fn filter_directive(config: &LoggingConfig, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        config.level.clone()
    }
}

fn build_filter(config: &LoggingConfig, verbose: bool) -> Result<EnvFilter, LoggingError> {
    if !verbose {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
    }
    let directive = filter_directive(config, verbose);
    EnvFilter::try_new(&directive).map_err(|e| LoggingError::InvalidFilter {
        filter: directive,
        message: e.to_string(),
    })
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<(), LoggingError> {
    let filter = build_filter(config, verbose)?;
    let registry = Registry::default().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    result.map_err(|e| LoggingError::Init(e.to_string()))
}
