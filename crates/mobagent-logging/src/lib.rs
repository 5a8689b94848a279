//! Logging bootstrap for the mobile agent.
//!
//! Every agent crate logs through the `tracing` macros. The host process calls
//! [`init_logging`] once at startup to route those events to the console
//! and/or a rolling log file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

pub use tracing::{debug, error, info, instrument, trace, warn};

/// Errors raised while installing the global subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The rolling file appender could not be created.
    #[error("failed to create rolling file appender: {0}")]
    Appender(#[from] rolling::InitError),

    /// A global subscriber was already installed.
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

/// Where and how agent logs are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive, used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,

    /// Where rolling log files go. Unset disables file output.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    /// `hourly`, `daily` or `never`.
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// Emit one JSON object per event instead of text lines.
    #[serde(default)]
    pub json_format: bool,

    #[serde(default = "default_true")]
    pub console_output: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "mobagent".into()
}

fn default_rotation() -> String {
    "daily".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: default_rotation(),
            json_format: false,
            console_output: true,
        }
    }
}

/// Map a rotation name onto the appender's rotation. Unknown names fall back to daily.
pub fn parse_rotation(name: &str) -> rolling::Rotation {
    match name {
        "hourly" => rolling::Rotation::HOURLY,
        "never" => rolling::Rotation::NEVER,
        _ => rolling::Rotation::DAILY,
    }
}

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

fn console_layer<S>(json: bool) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    }
}

/// Rolling file sink under `config.log_dir`, written off-thread.
fn file_layer<S>(
    config: &LogConfig,
    dir: &Path,
) -> Result<(BoxedLayer<S>, WorkerGuard), LoggingError>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    let appender = rolling::RollingFileAppender::builder()
        .rotation(parse_rotation(&config.rotation))
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .build(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = if config.json_format {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer().with_ansi(false).with_writer(writer).boxed()
    };
    Ok((layer, guard))
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over `config.level`. When file output is
/// enabled the returned guard owns the background writer; dropping it
/// flushes what is still buffered. Fails if a subscriber is already set.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            let (layer, guard) = file_layer(config, dir)?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let console = config.console_output.then(|| console_layer(config.json_format));

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    Ok(guard)
}

/// Install a subscriber that writes through the test harness capture.
///
/// Safe to call from every test; only the first call installs anything.
pub fn try_init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
