//! FCS decoding error types.

use thiserror::Error;

/// Result type for FCS operations.
pub type Result<T> = std::result::Result<T, Error>;

/// FCS decoding errors. Any of these aborts the whole decode.
#[derive(Error, Debug)]
pub enum Error {
    /// Header too short, missing magic, or with unusable TEXT offsets.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// TEXT segment out of bounds or too short to tokenize.
    #[error("malformed TEXT segment: {0}")]
    MalformedTextSegment(String),

    /// `$TOT` or `$PAR` missing or not a positive integer.
    #[error("missing or invalid required keyword {0}")]
    MissingRequiredField(&'static str),

    /// Resolved DATA offsets do not describe a usable byte range.
    #[error("invalid DATA segment range: start {start}, end {end}")]
    InvalidDataRange { start: u64, end: u64 },

    /// `$DATATYPE` or a parameter bit width this decoder cannot read.
    #[error("unsupported data type: {0}")]
    UnsupportedDataType(String),

    /// DATA segment shorter than `$TOT` events need.
    #[error("DATA segment too small (need {required} bytes, got {actual})")]
    DataSegmentTooSmall { required: u64, actual: u64 },
}
