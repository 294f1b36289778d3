//! Error types for data parsing in motionwatch-types.

use thiserror::Error;

/// Errors that can occur when parsing device data.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// A log line did not have the `name,date,time,movement` shape.
    #[error("Malformed log line: {0}")]
    MalformedLine(String),

    /// The date and time fields could not be parsed as a timestamp.
    #[error("Invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    /// The movement field was not a boolean literal.
    #[error("Invalid movement flag '{0}'")]
    InvalidMovement(String),

    /// A chart granularity other than `hour`, `day` or `all`.
    #[error("Unknown time measure '{0}'")]
    UnknownTimeMeasure(String),

    /// A device name was empty or contained characters unsafe for file names.
    #[error("Invalid device name '{name}': {reason}")]
    InvalidDeviceName { name: String, reason: &'static str },
}

/// Result type alias using motionwatch-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
