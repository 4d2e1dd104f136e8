//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is not a UUID.
    #[error("invalid {label} ID: {message}")]
    InvalidUuid { label: &'static str, message: String },

    /// The ID is a UUID of a version other than 4.
    #[error("invalid {label} ID: expected a version 4 UUID, got version {version}")]
    WrongVersion { label: &'static str, version: usize },

    /// The user ID contains characters outside the allowed set.
    #[error("invalid user ID: {message}")]
    InvalidUserId { message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
