//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Environment variable pointing at a log file; when set, logs are also
/// written to a daily rolling file next to it.
pub const LOG_PATH_ENV_VAR: &str = "DRA_LOG_PATH";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// The returned guard must be held for the lifetime of the process when a
/// log file is configured, otherwise buffered lines are dropped.
pub fn init() -> Option<WorkerGuard> {
    let log_path = std::env::var(LOG_PATH_ENV_VAR).ok();

    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let (file_layer, guard) = match log_path.as_deref().and_then(file_appender) {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter());
            (Some(file_layer), Some(guard))
        }
        None => (None, None),
    };

    registry().with(stderr_layer).with(file_layer).init();
    guard
}

fn file_appender(log_path: &str) -> Option<RollingFileAppender> {
    let path = Path::new(log_path);
    let dir = path.parent()?;
    let file = path.file_name()?.to_str()?;

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .max_log_files(3)
        .build(dir)
    {
        Ok(appender) => Some(appender),
        Err(e) => {
            eprintln!("failed to create rolling log file at {log_path}: {e}");
            None
        }
    }
}
