//! I/O and background-job error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Container decoding error.
    #[error("decode error: {0}")]
    Fcs(#[from] cytocomp_fcs::Error),

    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] cytocomp_core::Error),

    /// Compensation file is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A tunable was given an unusable value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation needs an open dataset.
    #[error("no dataset is loaded")]
    NoDataset,

    /// Density was requested before any full apply completed.
    #[error("no full dataset available; run apply first")]
    NoFullData,

    /// The background worker panicked or is no longer running.
    #[error("background worker fault: {0}")]
    WorkerFault(String),
}
