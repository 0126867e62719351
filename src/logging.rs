//! Logging setup for the injected module.
//!
//! The host process owns stdout/stderr, so the file layer is the one that
//! matters in practice: logs go to `%LOCALAPPDATA%\CrossLinkFG\logs` with
//! daily rotation. Set `CROSSLINK_LOG_FILTER` to a full `EnvFilter`
//! directive to override the level chosen in the config.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_FILE_PREFIX: &str = "crosslink-fg.log";
const FILTER_ENV_VAR: &str = "CROSSLINK_LOG_FILTER";

/// Keeps the non-blocking file writer flushing until process exit.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static INITIALIZED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("invalid log level: {s}")),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(value)
    }
}

impl From<LogLevel> for Option<Level> {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

/// Directory the rolling log files are written to, created on demand.
pub fn logs_dir() -> Result<PathBuf> {
    let dir = dirs::data_local_dir()
        .context("failed to resolve local data directory")?
        .join("CrossLinkFG")
        .join("logs");

    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create logs directory {}", dir.display()))?;
    }
    Ok(dir)
}

fn filter_for(level: LogLevel) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_env(FILTER_ENV_VAR) {
        return filter;
    }
    match Option::<Level>::from(level) {
        Some(lvl) => EnvFilter::new(format!("crosslink_fg={}", lvl.as_str())),
        None => EnvFilter::new("off"),
    }
}

/// Install the global subscriber. Calling this more than once is a no-op,
/// as is calling it when the host already installed its own subscriber.
pub fn init_logging(level: LogLevel, log_to_file: bool) -> Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr);

    let file_layer = if log_to_file && level != LogLevel::Off {
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .build(logs_dir()?)
            .context("failed to create rolling log file appender")?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(filter_for(level))
        .with(console_layer)
        .with(file_layer)
        .try_init();

    let _ = INITIALIZED.set(());
    if installed.is_err() {
        tracing::debug!("a global tracing subscriber was already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_round_trips_through_display() {
        for level in [
            LogLevel::Off,
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert_eq!(level.to_string().parse::<LogLevel>(), Ok(level));
        }
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn init_without_file_layer_is_idempotent() {
        assert!(init_logging(LogLevel::Debug, false).is_ok());
        assert!(init_logging(LogLevel::Trace, false).is_ok());
    }
}
