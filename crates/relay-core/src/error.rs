//! Unified process-level error type.

use thiserror::Error;

/// Errors surfaced at process boundaries (startup, configuration, shutdown).
///
/// Library crates keep their own error enums and convert into this one
/// where they meet the binary.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A required backing service is unreachable.
    #[error("Service unavailable: {service} - {message}")]
    Unavailable { service: String, message: String },

    /// Job subsystem failure.
    #[error("Job system error: {0}")]
    Jobs(String),

    /// Operation timed out.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Unavailable { .. } => "SERVICE_UNAVAILABLE",
            Self::Jobs(_) => "JOB_SYSTEM_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Process exit code to use when this error aborts startup.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 78,
            Self::Unavailable { .. } => 69,
            _ => 1,
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an unavailable-service error.
    #[must_use]
    pub fn unavailable(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }
}
