//! Error types for Tessera operations

use crate::EntityKind;
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {kind:?} with key {key}")]
    NotFound { kind: EntityKind, key: String },

    #[error("Integrity fault: {key} references missing content {hash}")]
    IntegrityFault { key: String, hash: String },

    #[error("Payload of {size} bytes exceeds the maximum blob size of {max} bytes")]
    CapacityExceeded { size: usize, max: usize },

    #[error("Transient backend failure: {reason}")]
    TransientBackend { reason: String },

    #[error("Transaction on {key} aborted after {attempts} conflicting attempts")]
    TransactionConflict { key: String, attempts: u32 },

    #[error("Serialization failed for {kind:?}: {reason}")]
    Serialization { kind: EntityKind, reason: String },

    #[error("Backend error: {reason}")]
    Backend { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid key name {key:?}: {reason}")]
    InvalidKeyName { key: String, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Value stored at {key} is not a structured array")]
    NotAnArray { key: String },

    #[error("Permission denied: {action} on {key}")]
    PermissionDenied { action: String, key: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Tessera errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TesseraError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TesseraError {
    /// HTTP status a routing layer should answer with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            TesseraError::Storage(e) => match e {
                StorageError::NotFound { .. } | StorageError::IntegrityFault { .. } => 404,
                StorageError::CapacityExceeded { .. } => 400,
                StorageError::TransientBackend { .. }
                | StorageError::TransactionConflict { .. } => 503,
                StorageError::Serialization { .. }
                | StorageError::Backend { .. }
                | StorageError::LockPoisoned => 500,
            },
            TesseraError::Validation(ValidationError::PermissionDenied { .. }) => 403,
            TesseraError::Validation(_) => 400,
            TesseraError::Config(_) => 500,
        }
    }

    /// Whether an idempotent outer retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TesseraError::Storage(
                StorageError::TransientBackend { .. } | StorageError::TransactionConflict { .. }
            )
        )
    }

    /// Whether this error is a plain miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TesseraError::Storage(StorageError::NotFound { .. }))
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        TesseraError::Storage(StorageError::TransientBackend {
            reason: reason.into(),
        })
    }

    pub fn backend(reason: impl Into<String>) -> Self {
        TesseraError::Storage(StorageError::Backend {
            reason: reason.into(),
        })
    }
}

/// Result type alias for Tessera operations.
pub type TesseraResult<T> = Result<T, TesseraError>;

// =============================================================================
// TESTS
// =============================================================================
