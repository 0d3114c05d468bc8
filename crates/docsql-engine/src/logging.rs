//! Subscriber setup for hosts embedding the engine
//!
//! The engine itself only emits `tracing` events. Hosts that have no
//! subscriber of their own can install one from [`LoggingConfig`] that
//! writes to stdout and/or a daily-rotated file.

use std::str::FromStr;

use thiserror::Error;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{Directive, ParseError};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE_NAME: &str = "docsql.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),

    #[error("failed to install subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format for development
    Pretty,
    /// JSON format for production (structured logging)
    Json,
    /// Compact format for testing
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        })
    }
}

/// Log output configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File,
    /// Log to both stdout and file
    Both,
}

impl FromStr for LogOutput {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Stdout,
        })
    }
}

fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    let mut filter = EnvFilter::try_new(level)?;
    // Filter out noisy third-party crates
    for directive in ["tokio=warn", "runtime=warn", "rusqlite=warn"] {
        filter = filter.add_directive(directive.parse::<Directive>()?);
    }
    Ok(filter)
}

fn file_appender(directory: &str) -> RollingFileAppender {
    std::fs::create_dir_all(directory).ok();
    RollingFileAppender::new(Rotation::DAILY, directory, LOG_FILE_NAME)
}

/// Install the global subscriber described by `config`
///
/// `EngineConfig::load` has already folded `RUST_LOG`, `LOG_FORMAT`,
/// `LOG_OUTPUT` and `LOG_DIR` into `config`.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let format: LogFormat = config.format.parse().unwrap_or(LogFormat::Pretty);
    let output: LogOutput = config.output.parse().unwrap_or(LogOutput::Stdout);
    let env_filter = build_filter(&config.level)?;

    let stdout_layer = match format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_ids(true)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    match output {
        LogOutput::Stdout => tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .try_init()?,
        LogOutput::File => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(file_appender(&config.directory))
                    .with_ansi(false),
            )
            .try_init()?,
        LogOutput::Both => {
            let file_layer = fmt::layer()
                .with_writer(file_appender(&config.directory))
                .with_ansi(false)
                .boxed();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .try_init()?
        }
    }

    tracing::info!(format = ?format, output = ?output, "Logging system initialized");
    if output != LogOutput::Stdout {
        tracing::debug!("  LOG_DIR: {}", config.directory);
    }
    Ok(())
}
