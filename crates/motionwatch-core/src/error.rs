//! Error types for motionwatch-core.
//!
//! # Recovery
//!
//! | Error | Scope | Caller sees |
//! |-------|-------|-------------|
//! | [`Error::UnknownDevice`] | request | rejected request |
//! | [`Error::AlreadyCheckedIn`] | request | rejected request |
//! | [`Error::InvalidStateForRotation`] | one device of a batch | reason in the batch message |
//! | [`Error::Persistence`] | request or one device of a batch | server error, state unchanged |
//! | [`Error::LogIo`] | request or one device of a batch | server error, prior log intact |
//! | [`Error::InvalidDeviceName`] | request | rejected request |
//!
//! Nothing here is retried automatically.

use std::fmt;
use std::path::PathBuf;

use motionwatch_types::ParseError;

/// Result type for motionwatch-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in motionwatch-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device name is not registered.
    #[error("{0} is not registered")]
    UnknownDevice(String),

    /// Check-in for a device that is currently checked in.
    #[error("{0} is already checked in")]
    AlreadyCheckedIn(String),

    /// A new set was requested for a device in the wrong state.
    #[error("{device} {reason}")]
    InvalidStateForRotation {
        device: String,
        reason: RotationRefusal,
    },

    /// The durable write failed; in-memory state was left unchanged.
    #[error("Failed to persist device state: {0}")]
    Persistence(#[from] motionwatch_store::Error),

    /// A filesystem operation on a device log failed.
    #[error("Failed to {action} {}: {source}", path.display())]
    LogIo {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The device name cannot be used as a log file name.
    #[error(transparent)]
    InvalidDeviceName(#[from] ParseError),
}

impl Error {
    /// Whether the error was caused by the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownDevice(_)
                | Error::AlreadyCheckedIn(_)
                | Error::InvalidStateForRotation { .. }
                | Error::InvalidDeviceName(_)
        )
    }

    pub(crate) fn log_io(
        action: &'static str,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(std::io::Error) -> Error {
        let path = path.into();
        move |source| Error::LogIo {
            action,
            path,
            source,
        }
    }
}

/// Why a new set could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationRefusal {
    /// The device must stop recording first.
    Recording,
    /// The previous new set has not been acknowledged by the device.
    NewSetPending,
}

impl fmt::Display for RotationRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationRefusal::Recording => write!(
                f,
                "is recording. Can only start new set when device is NOT recording"
            ),
            RotationRefusal::NewSetPending => write!(f, "still hasn't reset to new set"),
        }
    }
}
