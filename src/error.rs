//! Error types for the Tessera storage engine.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`TesseraError`] enum. Lock timeouts and duplicate document keys get
//! their own variants because callers react to them differently from
//! plain I/O failures: a lock timeout usually means "skip this cycle",
//! and a duplicate key during a merge triggers the bounded retry.
//!
//! # Examples
//!
//! ```
//! use tessera::error::{Result, TesseraError};
//!
//! fn open_segment(number: u32) -> Result<()> {
//!     Err(TesseraError::partition(format!("partition {number} is incomplete")))
//! }
//!
//! assert!(open_segment(3).is_err());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Tessera operations.
#[derive(Error, Debug)]
pub enum TesseraError {
    /// I/O errors (file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage backend errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Index-wide errors (active file, metadata file).
    #[error("Index error: {0}")]
    Index(String),

    /// Postings encoding/decoding errors.
    #[error("Postings error: {0}")]
    Postings(String),

    /// Partition open/dump/close errors.
    #[error("Partition error: {0}")]
    Partition(String),

    /// A file lock could not be acquired within its timeout.
    #[error("Lock error: {0}")]
    Lock(String),

    /// Merge errors.
    #[error("Merge error: {0}")]
    Merge(String),

    /// A document key was found in more than one merge input.
    #[error("Duplicate document key {key:?}: partition {partition}, document {doc_id}")]
    DuplicateKey {
        /// Partition number holding the copy that should be deleted.
        partition: u32,
        /// Original document ID inside that partition.
        doc_id: u32,
        /// The offending document key.
        key: String,
    },

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Thread join errors.
    #[error("Thread join error: {0}")]
    ThreadJoin(String),

    /// Operation cancelled (pipeline shut down).
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with TesseraError.
pub type Result<T> = std::result::Result<T, TesseraError>;

impl TesseraError {
    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        TesseraError::Storage(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        TesseraError::Index(msg.into())
    }

    /// Create a new postings error.
    pub fn postings<S: Into<String>>(msg: S) -> Self {
        TesseraError::Postings(msg.into())
    }

    /// Create a new partition error.
    pub fn partition<S: Into<String>>(msg: S) -> Self {
        TesseraError::Partition(msg.into())
    }

    /// Create a new lock error.
    pub fn lock<S: Into<String>>(msg: S) -> Self {
        TesseraError::Lock(msg.into())
    }

    /// Create a new merge error.
    pub fn merge<S: Into<String>>(msg: S) -> Self {
        TesseraError::Merge(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        TesseraError::InvalidArgument(msg.into())
    }

    /// Create a new cancelled error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        TesseraError::Cancelled(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        TesseraError::Other(msg.into())
    }

    /// Create a new data corruption error.
    ///
    /// Truncated or malformed on-disk data surfaces as an I/O error of kind
    /// `UnexpectedEof` so that it is handled like any other fatal read failure.
    pub fn truncated<S: Into<String>>(msg: S) -> Self {
        TesseraError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, msg.into()))
    }

    /// Whether this error is a lock acquisition failure.
    pub fn is_lock_error(&self) -> bool {
        matches!(self, TesseraError::Lock(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = TesseraError::partition("Test partition error");
        assert_eq!(error.to_string(), "Partition error: Test partition error");

        let error = TesseraError::lock("AL.main");
        assert_eq!(error.to_string(), "Lock error: AL.main");
        assert!(error.is_lock_error());

        let error = TesseraError::DuplicateKey {
            partition: 4,
            doc_id: 17,
            key: "doc-a".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Duplicate document key \"doc-a\": partition 4, document 17"
        );
        assert!(!error.is_lock_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = TesseraError::from(io_error);

        match error {
            TesseraError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }

        match TesseraError::truncated("short postings") {
            TesseraError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            _ => panic!("Expected IO error variant"),
        }
    }
}
