// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gridmover-core.
//!
//! The store surfaces only three kinds to its callers: validation failures,
//! conflicts and transient backend errors. `NotFound` is reported for lookups
//! that must hit an existing request.

use thiserror::Error;

/// Result type using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the request store.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The caller supplied an invalid request. Never persisted.
    #[error("Validation failed for '{field}': {message}")]
    Validation {
        /// The field (or entity path) that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Duplicate RequestName or a refused concurrent state transition.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Retryable backend failure.
    #[error("Transient error during {operation}: {details}")]
    Transient {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The addressed request does not exist.
    #[error("Request '{0}' not found")]
    NotFound(String),
}

impl StoreError {
    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a transient error.
    pub fn transient(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Transient {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::Transient { .. } => "TRANSIENT",
            Self::NotFound(_) => "NOT_FOUND",
        }
    }

    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err
            && db_err.is_unique_violation()
        {
            return Self::Conflict(db_err.message().to_string());
        }
        Self::Transient {
            operation: "database".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Transient {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}
