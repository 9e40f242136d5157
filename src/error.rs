//! Error types for the floodgate limiter.

use thiserror::Error;

/// Main error type for floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// An argument failed validation at the call boundary
    #[error("Invalid argument `{0}`: {1}")]
    InvalidArgument(&'static str, String),

    /// The requested burst cannot be honored even at the minimum 1ms period resolution
    #[error("Burst of {burst} cannot be honored at the minimum period resolution of 1ms")]
    UnsatisfiableBurst { burst: u32 },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation is not part of the component's contract
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Handoff to the callback executor was refused
    #[error("Dispatch rejected: {0}")]
    DispatchRejected(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
