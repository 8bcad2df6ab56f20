//! Error types for TagStore

use crate::types::{AppendMode, StrRef, Timestamp};
use thiserror::Error;

/// Result type alias for TagStore operations
pub type Result<T> = std::result::Result<T, TagStoreError>;

/// TagStore error types
#[derive(Error, Debug)]
pub enum TagStoreError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller supplied a bad argument; nothing was mutated
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Table already exists on disk with a different schema
    #[error("Table at {root} already exists, but the provided schema is not consistent:\nexisting: '{existing}'\nprovided: '{provided}'")]
    SchemaMismatch {
        root: String,
        existing: String,
        provided: String,
    },

    /// No table metadata at the given root
    #[error("Table at {0} does not exist yet, a table definition is required")]
    TableNotFound(String),

    /// Appended timestamp went backwards; in-memory state was rolled back
    #[error("Out of order timestamp for sub table {sub_table}: latest inserted was {last_ts}, tried to insert {timestamp} at row {row} (append mode: {mode:?})")]
    OutOfOrder {
        sub_table: String,
        last_ts: Timestamp,
        timestamp: Timestamp,
        row: usize,
        mode: AppendMode,
    },

    /// A string reference that was never minted
    #[error("Reference to unknown string (did you forget to mint it?): {0}")]
    UnresolvedStrRef(StrRef),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Durable state is ambiguous; the owning object refuses further work
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl TagStoreError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TagStoreError::Io(_))
    }

    /// Check if error was caused by caller input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TagStoreError::InvalidArgument(_)
                | TagStoreError::SchemaMismatch { .. }
                | TagStoreError::TableNotFound(_)
                | TagStoreError::UnresolvedStrRef(_)
        )
    }

    /// Check if error is an ordering conflict (state was rolled back before returning)
    pub fn is_ordering_conflict(&self) -> bool {
        matches!(self, TagStoreError::OutOfOrder { .. })
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TagStoreError::Corruption(_) | TagStoreError::ChecksumMismatch { .. }
        )
    }

    /// Check if error is unrecoverable
    pub fn is_fatal(&self) -> bool {
        matches!(self, TagStoreError::Fatal(_))
    }
}
