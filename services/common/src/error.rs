//! Error types for SIP Sieve services
//!
//! A single error enum for the userspace side, with HTTP status mapping for
//! the agent's handlers and helpers for attaching context to foreign errors.

use std::fmt::Display;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for SIP Sieve services
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found<E: Into<String>, I: Into<String>>(entity: E, id: I) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Check if error is a client error (4xx equivalent)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::NotFound { .. } | Error::InvalidInput(_)
        )
    }

    /// Get the HTTP status code equivalent
    pub fn http_status_code(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::InvalidInput(_) => 400,
            Error::NotFound { .. } => 404,
            Error::Config(_) | Error::Io(_) | Error::Internal(_) | Error::Other(_) => 500,
        }
    }

    /// Get a short error code string for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "UNKNOWN_ERROR",
        }
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContext<T, E> {
    /// Add context to an error
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        C: Display,
        F: FnOnce() -> C;

    /// Add context to an error with a static message
    fn context<C: Display>(self, context: C) -> Result<T>;
}

impl<T, E: Into<Error>> ErrorContext<T, E> for std::result::Result<T, E> {
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        C: Display,
        F: FnOnce() -> C,
    {
        self.map_err(|e| {
            let err: Error = e.into();
            Error::Internal(format!("{}: {}", context(), err))
        })
    }

    fn context<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|e| {
            let err: Error = e.into();
            Error::Internal(format!("{}: {}", context, err))
        })
    }
}

impl<T> ErrorContext<T, ()> for Option<T> {
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        C: Display,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::Internal(context().to_string()))
    }

    fn context<C: Display>(self, context: C) -> Result<T> {
        self.ok_or_else(|| Error::Internal(context.to_string()))
    }
}

/// Trait for converting errors to internal errors with context
pub trait IntoInternal {
    fn into_internal(self) -> Error;
    fn internal_with_context<C: Display>(self, context: C) -> Error;
}

impl<E: std::error::Error> IntoInternal for E {
    fn into_internal(self) -> Error {
        Error::Internal(self.to_string())
    }

    fn internal_with_context<C: Display>(self, context: C) -> Error {
        Error::Internal(format!("{}: {}", context, self))
    }
}
