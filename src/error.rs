use std::path::PathBuf;

use thiserror::Error;

/// A queue message that can never be turned into a job, no matter how often
/// it is redelivered.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Malformed job record: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Missing required config key: {0}")]
    Missing(&'static str),

    #[error("Invalid value for config key {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Broker connection failed: {0}")]
    Connect(String),

    #[error("Broker channel error: {0}")]
    Channel(String),

    #[error("Publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("Queue {0} is not bound")]
    NotBound(String),

    #[error("Gateway closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<lapin::Error> for GatewayError {
    fn from(e: lapin::Error) -> Self {
        GatewayError::Channel(e.to_string())
    }
}

/// Outcome of a workflow attempt that did not exit cleanly.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Workflow exited with code {code:?}")]
    Failed { code: Option<i32>, output: String },

    #[error("aborted")]
    Aborted { output: String },
}

impl ExecutionError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionError::Failed { code, .. } => *code,
            _ => None,
        }
    }

    /// Captured output, if the process got far enough to produce any.
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecutionError::Failed { output, .. } | ExecutionError::Aborted { output } => {
                Some(output.as_str())
            }
            ExecutionError::Launch { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
