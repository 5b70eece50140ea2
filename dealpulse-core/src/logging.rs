//! Operator-side log output for hosts embedding dealpulse
//!
//! The library only emits `tracing` events; nothing is written until the host
//! opts in with [`init`]. Swallowed pipeline failures reach this output
//! through [`crate::observer::TracingObserver`] at `warn`, breaker transitions
//! at `debug`, and session creation, resumption and finalization at `info`.
//!
//! Files land in `$XDG_STATE_HOME/dealpulse/` as `dealpulse.log.<date>`.

use crate::config::{Config, LoggingConfig};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Install the global subscriber for a host process
///
/// The level comes from `[logging] level` unless `RUST_LOG` is set. Files
/// rotate daily and at most `max_files` are kept. Fails with
/// [`Error::Config`](crate::error::Error::Config) when a subscriber is
/// already installed, so a host that brings its own keeps it.
pub fn init(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    let log_dir = Config::state_dir();

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("dealpulse.log")
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| crate::error::Error::Config(format!("failed to create log appender: {}", e)))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .map_err(|e| crate::error::Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        max_files = config.max_files,
        "dealpulse logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Route pipeline logs to the test harness; safe to call from every test
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Keeps the background log writer running; hold it until the host exits
///
/// Dropping it flushes lines still queued, including failures reported by
/// fire-and-forget writes that finished during shutdown.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Base path of the rotating log files, shown by `dealpulse status`
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}
