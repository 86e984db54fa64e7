//! Error types for hygro-types.

use thiserror::Error;

/// Errors that can occur when parsing reading data or query parameters.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A timestamp was not valid RFC3339.
    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    /// The lower bound of a range is after its upper bound.
    #[error("Invalid range: from {from} is after to {to}")]
    InvertedRange { from: String, to: String },
}

/// Result type alias using hygro-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
