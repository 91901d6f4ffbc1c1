//! Log sinks: colored stderr plus an append-only log file.

use std::fs::OpenOptions;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{MonitorError, Result};

pub struct LogOptions<'a> {
    pub debug: bool,
    pub color: bool,
    /// None disables the log file.
    pub log_file: Option<&'a Path>,
}

/// Installs the global subscriber. The returned guard flushes the file sink
/// on drop and must be held until exit.
pub fn init(options: LogOptions<'_>) -> Result<Option<WorkerGuard>> {
    let filter = if options.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(options.color);

    let (file_layer, guard) = match options.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| {
                    MonitorError::io(format!("Failed to open log file {}", path.display()), err)
                })?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| MonitorError::Config(format!("Failed to install logger: {}", err)))?;

    Ok(guard)
}
