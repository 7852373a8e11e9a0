//! Error handling for the storage layer.
//!
//! Uses `anyhow::Result` at every public boundary. Failures the caller may
//! need to tell apart carry a [`StorageError`], recoverable with
//! `err.downcast_ref::<StorageError>()` (this also sees through `.context()`).
//!
//! A missing snapshot is not an error: `load` returns `Ok(None)`.

use std::fmt::Display;

use thiserror::Error;

/// Convenience re-export of anyhow::Result
pub use anyhow::Result;

/// Failure taxonomy of the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Missing or invalid backend option, or an invalid database name.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation attempted on a closed connector (or a map whose store closed).
    #[error("Connector for database '{database}' is already closed")]
    Closed { database: String },

    /// Underlying read/write/drop failed.
    #[error("I/O failure during {operation} on '{target}': {message}")]
    Io {
        operation: &'static str,
        target: String,
        message: String,
    },

    /// A big map field could not be bound.
    #[error("Cannot bind big map '{name}': {message}")]
    Binding { name: String, message: String },

    /// KnowledgeBase used out of order.
    #[error("Illegal state: {0}")]
    IllegalState(String),
}

impl StorageError {
    /// Extract the storage error kind from an `anyhow::Error`, if any.
    pub fn of(err: &anyhow::Error) -> Option<&StorageError> {
        err.downcast_ref::<StorageError>()
    }

    pub fn is_closed(err: &anyhow::Error) -> bool {
        matches!(Self::of(err), Some(StorageError::Closed { .. }))
    }
}

/// Create a configuration error
pub fn configuration(message: impl Into<String>) -> anyhow::Error {
    StorageError::Configuration(message.into()).into()
}

/// Create a closed-connector error
pub fn closed(database: &str) -> anyhow::Error {
    StorageError::Closed {
        database: database.to_string(),
    }
    .into()
}

/// Create an I/O failure from any displayable cause
pub fn io_failure(operation: &'static str, target: impl Display, cause: impl Display) -> anyhow::Error {
    StorageError::Io {
        operation,
        target: target.to_string(),
        message: cause.to_string(),
    }
    .into()
}

/// Create a binding error
pub fn binding(name: &str, message: impl Into<String>) -> anyhow::Error {
    StorageError::Binding {
        name: name.to_string(),
        message: message.into(),
    }
    .into()
}

/// Create an illegal-state error
pub fn illegal_state(message: impl Into<String>) -> anyhow::Error {
    StorageError::IllegalState(message.into()).into()
}
