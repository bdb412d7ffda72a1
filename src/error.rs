//! Error handling for the webeye camera controller.

use std::fmt;

use thiserror::Error;

/// Which background session an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Stream,
    Record,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Stream => write!(f, "stream"),
            SessionKind::Record => write!(f, "record"),
        }
    }
}

/// Controller error types
#[derive(Error, Debug)]
pub enum OurError {
    /// Settings values outside their valid range
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Device index cannot be opened, or the binding was released
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A session was started while one of the same kind is active
    #[error("A {0} session is already running")]
    AlreadyRunning(SessionKind),

    /// The handle is no longer able to run sessions
    #[error("Not running: {0}")]
    NotRunning(String),

    /// Registry already holds a camera under this id
    #[error("Camera '{0}' is already registered")]
    AlreadyRegistered(String),

    /// Registry has no camera under this id
    #[error("Camera '{0}' not found")]
    NotFound(String),

    /// A forwarder was called without an id and no active camera is set
    #[error("No active camera selected")]
    NoActiveCamera,

    /// The device returned no usable frame
    #[error("Read failure: {0}")]
    ReadFailure(String),

    /// Encoding or writing a still or video failed
    #[error("Write failure: {0}")]
    WriteFailure(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Controller configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Controller result type
pub type OurResult<T> = std::result::Result<T, OurError>;
