//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the configured
//! level.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed, in which case
/// nothing changes.
///
/// ```
/// use grpc_engine::config::LoggingConfig;
///
/// grpc_engine::logging::init(&LoggingConfig::default());
/// tracing::info!("engine starting");
/// ```
pub fn init(config: &LoggingConfig) -> bool {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry
            .with(fmt::layer().with_ansi(true).with_target(config.target))
            .try_init(),
        (LogFormat::Pretty, false) => registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(config.target)
                    .without_time(),
            )
            .try_init(),
        (LogFormat::Json, true) => registry
            .with(fmt::layer().json().with_target(config.target))
            .try_init(),
        (LogFormat::Json, false) => registry
            .with(fmt::layer().json().with_target(config.target).without_time())
            .try_init(),
        (LogFormat::Compact, true) => registry
            .with(fmt::layer().compact().with_target(config.target))
            .try_init(),
        (LogFormat::Compact, false) => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(config.target)
                    .without_time(),
            )
            .try_init(),
    };
    result.is_ok()
}
