//! Worker and parse-unit log setup.

use crate::config::{LogRotation, LogSettings};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE: &str = "modweave.log";

/// SQLite chatter stays at warn unless the configured level names it.
const QUIET_DEPENDENCIES: &[&str] = &["rusqlite=warn"];

/// Filter directives for `settings`, used when `RUST_LOG` is unset.
pub fn filter_directives(settings: &LogSettings) -> String {
    let level = settings.level.trim();
    let mut directives = vec![if level.is_empty() { "info" } else { level }.to_string()];
    for quiet in QUIET_DEPENDENCIES {
        let target = quiet.split('=').next().unwrap_or(quiet);
        if !level.contains(target) {
            directives.push((*quiet).to_string());
        }
    }
    directives.join(",")
}

fn appender(dir: &Path, rotation: LogRotation) -> RollingFileAppender {
    match rotation {
        LogRotation::Never => rolling::never(dir, LOG_FILE),
        LogRotation::Daily => rolling::daily(dir, LOG_FILE),
        LogRotation::Hourly => rolling::hourly(dir, LOG_FILE),
    }
}

/// Install the worker's subscriber: a file under `log_dir`, plus stdout when
/// enabled. The returned guard flushes the file writer when dropped.
pub fn init_logging(settings: &LogSettings, log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender(log_dir, settings.rotation));

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(settings))?,
    };
    let stdout = settings
        .stdout
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stdout));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(stdout)
        .try_init()?;

    Ok(guard)
}

/// Logging for the `parse-unit` child: warnings only, on stderr, so stdout
/// stays a clean JSON channel.
pub fn init_child_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .try_init();
}
