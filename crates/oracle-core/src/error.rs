// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for oracle-core.
//!
//! A single error type is shared by the run store, the log consumption tracker
//! and both persistence backends. Each variant carries a stable error code so
//! callers can branch on the failure class without matching on messages.

use std::fmt;

use uuid::Uuid;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the run store and the log consumption tracker.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// The caller supplied a value that cannot be persisted as-is.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Pipeline run was not found.
    RunNotFound {
        /// The run ID that was not found.
        run_id: i64,
    },

    /// Task run was not found, or its run is no longer running or suspended.
    TaskRunNotFound {
        /// The task run ID.
        task_run_id: Uuid,
    },

    /// A log broadcast with this identity has already been recorded.
    BroadcastAlreadyExists {
        /// Chain the log was observed on.
        chain_id: i64,
        /// Hex-encoded block hash.
        block_hash: String,
        /// Index of the log within the block.
        log_index: i64,
        /// Subscribing job.
        job_id: i32,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::TaskRunNotFound { .. } => "TASK_RUN_NOT_FOUND",
            Self::BroadcastAlreadyExists { .. } => "BROADCAST_ALREADY_EXISTS",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// True for "doesn't exist / already done" outcomes, as opposed to failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RunNotFound { .. } | Self::TaskRunNotFound { .. }
        )
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn database(operation: &str, err: impl fmt::Display) -> Self {
        Self::DatabaseError {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::RunNotFound { run_id } => {
                write!(f, "Pipeline run {} not found", run_id)
            }
            Self::TaskRunNotFound { task_run_id } => {
                write!(
                    f,
                    "Task run '{}' not found or its run is no longer in progress",
                    task_run_id
                )
            }
            Self::BroadcastAlreadyExists {
                chain_id,
                block_hash,
                log_index,
                job_id,
            } => {
                write!(
                    f,
                    "Log broadcast already exists for job {} (chain {}, block {}, log index {})",
                    job_id, chain_id, block_hash, log_index
                )
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::database("query", err)
    }
}

/// Wrap a sqlx error with the name of the operation that failed.
pub(crate) fn db(operation: &'static str) -> impl FnOnce(sqlx::Error) -> CoreError {
    move |err| CoreError::database(operation, err)
}

/// Returns true when a sqlx error is a unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db_err| db_err.is_unique_violation())
        .unwrap_or(false)
}
