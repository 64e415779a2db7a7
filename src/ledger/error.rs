//! Error types for the warning ledger
//!
//! This module defines the errors that ledger operations surface to callers.

use thiserror::Error;

use super::backend::BackendError;

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Caller supplied input that cannot be accepted
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The persistent store rejected or failed the operation
    #[error("Persistence error: {0}")]
    Persistence(#[from] BackendError),

    /// A stored row could not be decoded into a warning
    #[error("Malformed warning row {id}: {reason}")]
    MalformedRow { id: u64, reason: String },
}

impl LedgerError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether the error came from the persistent store
    #[must_use]
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
