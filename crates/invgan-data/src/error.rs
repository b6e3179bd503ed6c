//! Error types for image loading and checkpoint manifests

use std::path::PathBuf;

use thiserror::Error;

/// Result type for data operations
pub type DataResult<T> = Result<T, DataError>;

/// Errors that can occur while reading images or manifests
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Data not found at `{path}`")]
    NotFound { path: PathBuf },

    #[error("No images found in `{path}`")]
    Empty { path: PathBuf },

    #[error("I/O error at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot decode image `{path}`: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Index {index} out of bounds (source has {len} images)")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Malformed manifest `{path}`: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DataError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DataError::Io { path: path.into(), source }
    }

    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        DataError::InvalidValue { field, reason: reason.into() }
    }
}
