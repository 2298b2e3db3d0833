use std::path::Path;

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Drop last; flushes the file writer.
#[allow(dead_code)]
pub struct LoggerGuard(WorkerGuard);

/// Field units keep a short local history, so files rotate hourly and at most a day is kept.
pub fn init_logging(log_dir: impl AsRef<Path>, prefix: &str, level: &str) -> anyhow::Result<LoggerGuard> {
    let log_dir = log_dir.as_ref();
    let default_level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    };

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(24)
        .build(log_dir)
        .with_context(|| format!("Failed to create log appender in {:?}", log_dir))?;
    let (non_blocking, guard) = NonBlocking::new(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(filter()),
        )
        .with(fmt::layer().with_writer(std::io::stdout).with_filter(filter()))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if level.parse::<LevelFilter>().is_err() {
        tracing::warn!("Invalid log level '{}', defaulting to 'info'", level);
    }

    Ok(LoggerGuard(guard))
}
