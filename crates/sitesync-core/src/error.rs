// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types for sitesync.

use thiserror::Error;

/// A specialized `Result` type for sitesync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during reconciliation.
#[derive(Debug, Error)]
pub enum Error {
    /// Any failure of the underlying persistence layer.
    #[error("database operation failed: {0}")]
    Database(String),

    /// Storage driver failure other than a missing object.
    #[error("storage driver error: {0}")]
    Driver(String),

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding of an exchanged record failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The request was asked to stop and a step observed it at a batch boundary.
    #[error("request {request_id} was stopped")]
    Stopped {
        /// The stopped request.
        request_id: String,
    },

    /// Some items of a bulk write loop failed while the rest were written.
    #[error("{failed} item(s) failed during bulk write, first failure: {first}")]
    PartialBatch {
        /// Number of failed items.
        failed: usize,
        /// Description of the first failure.
        first: String,
    },
}

impl Error {
    /// Creates a new driver error.
    #[must_use]
    pub fn driver(message: impl std::fmt::Display) -> Self {
        Self::Driver(message.to_string())
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates a new invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Returns true if the error is the cooperative stop signal.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }
}

/// Wraps any persistence failure into [`Error::Database`].
pub fn db_err(e: impl std::fmt::Display) -> Error {
    Error::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_error_message_carries_cause() {
        let err = db_err("table locked");
        assert_eq!(err.to_string(), "database operation failed: table locked");
    }

    #[test]
    fn test_partial_batch_message() {
        let err = Error::PartialBatch { failed: 3, first: "bad key".to_string() };
        assert!(err.to_string().contains("3 item(s)"));
        assert!(err.to_string().contains("bad key"));
    }

    #[test]
    fn test_is_stopped() {
        assert!(Error::Stopped { request_id: "r1".to_string() }.is_stopped());
        assert!(!Error::not_found("x").is_stopped());
    }
}
