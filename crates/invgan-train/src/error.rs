//! Error types for training

use std::path::PathBuf;

use invgan_data::DataError;
use thiserror::Error;

/// Result type for training operations
pub type TrainResult<T> = Result<T, TrainError>;

/// Errors that can occur while building, training or persisting the networks
#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),

    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error(
        "Non-finite loss at step {step}: gen={generator}, disc={critic}, inv={inverter}"
    )]
    NonFiniteLoss {
        step: u64,
        generator: f64,
        critic: f64,
        inverter: f64,
    },

    #[error("Checkpoint error at `{path}`: {message}")]
    Checkpoint { path: PathBuf, message: String },

    #[error("Cannot restore checkpoint `{path}`: {message}")]
    Restore { path: PathBuf, message: String },

    #[error("Session is closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Metrics error: {0}")]
    Csv(#[from] csv::Error),
}

impl TrainError {
    pub fn checkpoint(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        TrainError::Checkpoint { path: path.into(), message: message.into() }
    }

    pub fn restore(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        TrainError::Restore { path: path.into(), message: message.into() }
    }
}

/// Invalid or unreadable training configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config file `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown device `{0}` (expected cpu, cuda, cuda:N or auto)")]
    UnknownDevice(String),
}

impl ConfigError {
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}
