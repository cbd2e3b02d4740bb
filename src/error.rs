//! Error types for onirec

use std::io;
use thiserror::Error;

use crate::storage::Version;

/// Result type for onirec operations
pub type Result<T> = std::result::Result<T, OniError>;

/// Errors that can occur while recording or playing back ONI files
#[derive(Debug, Error)]
pub enum OniError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed call arguments
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// Codec or record assembly capacity exceeded
    #[error("Output buffer overflow: {needed} bytes needed, capacity is {capacity}")]
    OutputBufferOverflow {
        /// Bytes required by the operation
        needed: usize,
        /// Bytes available in the output buffer
        capacity: usize,
    },

    /// File format version older than the oldest supported one
    #[error("Unsupported file format version {found}, oldest supported is {oldest}")]
    UnsupportedFormatVersion {
        /// Version found in the file
        found: Version,
        /// Oldest version this crate can read
        oldest: Version,
    },

    /// Short read or garbage in the middle of a record
    #[error("Corrupt or truncated recording at offset {offset}: {reason}")]
    CorruptOrTruncated {
        /// File offset where the problem was detected
        offset: u64,
        /// What was wrong
        reason: String,
    },

    /// A lock guarding a single-flight operation is already held
    #[error("Resource locked: {0}")]
    ResourceLocked(String),

    /// Seek target lies beyond the recorded data
    #[error("Seek out of range: {0}")]
    SeekOutOfRange(String),

    /// A worker thread did not exit within its shutdown deadline
    #[error("Thread '{0}' did not exit in time")]
    ThreadTimeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl OniError {
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptOrTruncated {
            offset,
            reason: reason.into(),
        }
    }
}
