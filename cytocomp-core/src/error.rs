//! Error types for cytocomp-core.

use thiserror::Error;

/// Result type alias for cytocomp-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
#[derive(Error, Debug)]
pub enum Error {
    /// A persisted compensation matrix does not fit the open dataset.
    #[error("compensation shape mismatch: {0}")]
    CoeffShapeMismatch(String),

    /// A channel index outside the dataset's parameter list.
    #[error("channel {index} out of range (dataset has {n_channels} channels)")]
    ChannelOutOfRange { index: usize, n_channels: usize },

    /// Unknown gate identifier.
    #[error("unknown gate: {0}")]
    UnknownGate(String),

    /// Malformed compensation JSON text.
    #[error("invalid compensation JSON: {0}")]
    Json(#[from] serde_json::Error),
}
