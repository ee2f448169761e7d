/*!
# Shared Types and Utilities

This crate contains the hardware-free types and algorithms shared by the SPI
capture components: everything that can be exercised without a bus or a GPIO
line attached.

## Core Types

- [`CaptureBuffer`] - Owned receive buffer for one transaction
- [`ChunkPlan`] / [`Chunk`] - Partition of a transfer into bus operations
- [`WordBuffer`] - Little-endian 32-bit words reassembled from a capture
- [`ValidationResult`] - Parity classification of the leading words

## Modules

- [`buffer`] - Capture buffer and chunk partitioning
- [`word`] - Byte-to-word reassembly
- [`pattern`] - Parity-class sanity check
- [`error`] - Common error types
*/

pub mod buffer;
pub mod word;
pub mod pattern;
pub mod error;

// Re-export commonly used types
pub use buffer::{CaptureBuffer, Chunk, ChunkPlan};
pub use word::{assemble, WordBuffer};
pub use pattern::{classify, Parity, ValidationResult};
pub use error::{SharedError, Result};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Size of a reassembled data word in bytes
    pub const WORD_SIZE_BYTES: usize = 4;

    /// Number of 32-bit words the peripheral emits per transaction
    pub const DEFAULT_WORD_COUNT: usize = 4096;

    /// Bytes moved per bus operation
    pub const DEFAULT_CHUNK_SIZE: usize = 256;

    /// Leading words inspected by the parity check
    pub const PARITY_SAMPLE_COUNT: usize = 10;

    /// Bytes shown when echoing a received buffer
    pub const ECHO_BYTES: usize = 16;

    /// Words shown when echoing a received buffer
    pub const ECHO_WORDS: usize = 8;
}
