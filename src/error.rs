//! Error types for chunk, manifest and sync operations.

use std::io;
use thiserror::Error;

/// Errors that can occur while moving chunked content around.
#[derive(Error, Debug)]
pub enum ChunkSyncError {
    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP request error during download or upload.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// Transport-level failure (bad status, unreachable mirror, missing link).
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed manifest or chunk bytes (bad magic, truncated data).
    #[error("Format error: {0}")]
    Format(String),

    /// Size or hash mismatch after decompression.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// A referenced chunk or file is not where it should be.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// Operation not allowed in the current state (e.g. duplicate sync).
    #[error("State error: {0}")]
    State(String),

    /// Not enough room or an unusable destination.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The progress sink asked us to stop.
    #[error("Operation cancelled")]
    Cancelled,
}

impl ChunkSyncError {
    /// Whether a per-chunk retry has any chance of succeeding.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ChunkSyncError::IoError(_)
                | ChunkSyncError::ReqwestError(_)
                | ChunkSyncError::Network(_)
                | ChunkSyncError::Integrity(_)
        )
    }
}

/// Shorthand used across the crate.
pub type Result<T> = std::result::Result<T, ChunkSyncError>;
