//! Error types for the Lox I/O crate.
//!
//! This module provides error handling for binary stream operations:
//! reading past the end of a buffer, malformed data, and write failures.

use thiserror::Error;

/// I/O operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// Unexpected end of stream
    #[error("Unexpected end of stream: expected {expected} more bytes while reading {context}")]
    EndOfStream { expected: usize, context: String },

    /// Invalid data content
    #[error("Invalid data: {context}, value: {value}")]
    InvalidData { context: String, value: String },

    /// Stream position error
    #[error("Stream position error: attempted to seek to {position}, stream size {size}")]
    StreamPosition { position: usize, size: usize },

    /// Underlying I/O operation failed
    #[error("I/O operation failed: {operation}, reason: {reason}")]
    Operation { operation: String, reason: String },
}

impl IoError {
    /// Creates a new end-of-stream error.
    pub fn end_of_stream<S: Into<String>>(expected: usize, context: S) -> Self {
        Self::EndOfStream {
            expected,
            context: context.into(),
        }
    }

    /// Creates a new invalid-data error.
    pub fn invalid_data<S: Into<String>>(context: S, value: S) -> Self {
        Self::InvalidData {
            context: context.into(),
            value: value.into(),
        }
    }

    /// Creates a new operation error.
    pub fn operation<S: Into<String>>(operation: S, reason: S) -> Self {
        Self::Operation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for I/O operations
pub type IoResult<T> = std::result::Result<T, IoError>;

impl From<std::io::Error> for IoError {
    fn from(error: std::io::Error) -> Self {
        IoError::operation("io".to_string(), error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = IoError::end_of_stream(4, "chunk header");
        assert_eq!(
            error.to_string(),
            "Unexpected end of stream: expected 4 more bytes while reading chunk header"
        );
    }

    #[test]
    fn test_from_std_io() {
        let error: IoError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(error, IoError::Operation { .. }));
    }
}
