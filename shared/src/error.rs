/*!
Common error types for the SPI capture components.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, SharedError>;

/// Error type for all shared operations
#[derive(Error, Debug)]
pub enum SharedError {
    /// Buffer sizes that cannot hold a whole number of words
    #[error("Invalid buffer size: {0}")]
    InvalidBufferSize(String),

    /// Chunk sizes that cannot partition a transfer
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),
}

impl SharedError {
    /// Create a new invalid buffer size error
    pub fn invalid_buffer_size(msg: impl Into<String>) -> Self {
        Self::InvalidBufferSize(msg.into())
    }

    /// Create a new invalid chunk size error
    pub fn invalid_chunk_size(msg: impl Into<String>) -> Self {
        Self::InvalidChunkSize(msg.into())
    }
}
