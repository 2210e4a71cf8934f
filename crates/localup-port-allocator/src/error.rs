//! Error types for the port allocator

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading or writing the persisted port map
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read port map {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write port map {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Used by non-file stores and test doubles
    #[error("Port map unavailable: {0}")]
    Unavailable(String),
}

/// Invalid allocation window
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("Port range minimum {min} is greater than maximum {max}")]
    Inverted { min: u16, max: u16 },

    #[error("Port 0 cannot be part of the allocation range")]
    ZeroPort,
}

/// Failures that stop the allocator from answering at all.
///
/// Business outcomes (exhausted, conflict, illegal port) are not errors, see
/// [`crate::Rejection`].
#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("Failed to persist allocation table: {0}")]
    Storage(#[from] StoreError),

    #[error("Allocation table lock poisoned")]
    LockPoisoned,

    #[error("Allocator halted after an earlier persistence failure")]
    Halted,
}
