//! Error types for the monitor.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Must be run as root")]
    NotRoot,

    #[error("another monitor instance owns {0}")]
    AlreadyRunning(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to run {command}: {source}")]
    ProbeSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} produced no output")]
    ProbeNoOutput { command: String },

    #[error("{command} printed no upgrade summary")]
    ProbeNoSummary { command: String },
}

impl MonitorError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        MonitorError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
