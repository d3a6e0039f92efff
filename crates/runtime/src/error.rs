//! error

use std::{error, fmt};

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the engine. Codes propagate unchanged from the
/// layer that produced them; the engine never translates one kind into
/// another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid inputs, rejected synchronously without side effects
    InvalidParameter,
    /// The resolver or the low-level hook could not find the file
    FileNotFound,
    /// Generic backend failure
    Fail,
    /// Buffer pool or object storage exhausted after cleanup was attempted
    InsufficientMemory,
    /// The operation was abandoned by a cancel or a destroy
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::FileNotFound => write!(f, "file not found"),
            Self::Fail => write!(f, "device i/o failure"),
            Self::InsufficientMemory => write!(f, "insufficient memory"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound,
            std::io::ErrorKind::OutOfMemory => Self::InsufficientMemory,
            _ => Self::Fail,
        }
    }
}
