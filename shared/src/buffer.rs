/*!
Capture buffer and chunk partitioning.

A transaction moves a fixed number of bytes from the peripheral in bounded
bus operations. [`ChunkPlan`] describes that partition and [`CaptureBuffer`]
is the owned destination, reused from one transaction to the next.
*/

use crate::error::{Result, SharedError};
use crate::protocol::WORD_SIZE_BYTES;
use std::ops::Range;

/// One bus operation: a view into the capture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Position of this chunk within the plan
    pub index: usize,
    /// Byte offset into the capture buffer
    pub offset: usize,
    /// Number of bytes moved by this operation
    pub len: usize,
}

impl Chunk {
    /// Byte range this chunk covers in the capture buffer
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    /// Offset of the first byte after this chunk
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Partition of `total_len` bytes into chunks of at most `chunk_size` bytes.
///
/// `total_len / chunk_size` full chunks are followed by one shorter chunk
/// holding the remainder, if there is one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_len: usize,
    chunk_size: usize,
}

impl ChunkPlan {
    /// Create a plan, rejecting a zero chunk size
    pub fn new(total_len: usize, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(SharedError::invalid_chunk_size("chunk size must be greater than zero"));
        }

        Ok(Self { total_len, chunk_size })
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks moving exactly `chunk_size` bytes
    pub fn full_chunks(&self) -> usize {
        self.total_len / self.chunk_size
    }

    /// Length of the trailing short chunk, zero when there is none
    pub fn remainder(&self) -> usize {
        self.total_len % self.chunk_size
    }

    /// Total number of bus operations, `ceil(total_len / chunk_size)`
    pub fn chunk_count(&self) -> usize {
        self.full_chunks() + usize::from(self.remainder() > 0)
    }

    /// Iterate the chunks in transfer order
    pub fn chunks(&self) -> impl Iterator<Item = Chunk> {
        let chunk_size = self.chunk_size;
        let total_len = self.total_len;

        (0..self.chunk_count()).map(move |index| {
            let offset = index * chunk_size;
            Chunk {
                index,
                offset,
                len: chunk_size.min(total_len - offset),
            }
        })
    }
}

/// Owned, fixed-capacity receive buffer for one transaction
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    bytes: Vec<u8>,
}

impl CaptureBuffer {
    /// Allocate a zeroed buffer of `total_len` bytes.
    ///
    /// The length must be non-zero and a whole number of words so the
    /// buffer can always be reassembled.
    pub fn new(total_len: usize) -> Result<Self> {
        if total_len == 0 {
            return Err(SharedError::invalid_buffer_size("capture buffer cannot be empty"));
        }

        if total_len % WORD_SIZE_BYTES != 0 {
            return Err(SharedError::invalid_buffer_size(format!(
                "{} bytes is not a multiple of the {}-byte word size",
                total_len, WORD_SIZE_BYTES
            )));
        }

        Ok(Self { bytes: vec![0u8; total_len] })
    }

    /// Allocate a buffer holding `word_count` 32-bit words
    pub fn for_words(word_count: usize) -> Result<Self> {
        let total_len = word_count.checked_mul(WORD_SIZE_BYTES).ok_or_else(|| {
            SharedError::invalid_buffer_size(format!("{} words overflows the address space", word_count))
        })?;

        Self::new(total_len)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of whole words this buffer reassembles into
    pub fn word_count(&self) -> usize {
        self.bytes.len() / WORD_SIZE_BYTES
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable view of the bytes a chunk writes into
    pub fn chunk_mut(&mut self, chunk: &Chunk) -> &mut [u8] {
        &mut self.bytes[chunk.range()]
    }

    /// Zero the buffer before it is reused
    pub fn reset(&mut self) {
        self.bytes.fill(0);
    }

    /// The first `n` bytes, or the whole buffer if it is shorter
    pub fn head(&self, n: usize) -> &[u8] {
        &self.bytes[..n.min(self.bytes.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_partition_total_length() {
        let cases = [
            (16384, 256),
            (16384, 4096),
            (32768, 4096),
            (1000, 256),
            (4, 3),
            (256, 1),
            (0, 256),
            (100, 1000),
        ];

        for (total_len, chunk_size) in cases {
            let plan = ChunkPlan::new(total_len, chunk_size).unwrap();
            let chunks: Vec<Chunk> = plan.chunks().collect();

            let sum: usize = chunks.iter().map(|c| c.len).sum();
            assert_eq!(sum, total_len, "sum for {}/{}", total_len, chunk_size);
            assert_eq!(chunks.len(), total_len.div_ceil(chunk_size), "count for {}/{}", total_len, chunk_size);
            assert!(chunks.iter().all(|c| c.len <= chunk_size && c.len > 0));

            // Contiguous, in order, no overlap
            let mut expected_offset = 0;
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.index, i);
                assert_eq!(chunk.offset, expected_offset);
                expected_offset = chunk.end();
            }
        }
    }

    #[test]
    fn test_remainder_chunk_is_last_and_short() {
        let plan = ChunkPlan::new(1000, 256).unwrap();
        assert_eq!(plan.full_chunks(), 3);
        assert_eq!(plan.remainder(), 232);
        assert_eq!(plan.chunk_count(), 4);

        let last = plan.chunks().last().unwrap();
        assert_eq!(last.offset, 768);
        assert_eq!(last.len, 232);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(ChunkPlan::new(1024, 0), Err(SharedError::InvalidChunkSize(_))));
    }

    #[test]
    fn test_capture_buffer_sizing() {
        let buffer = CaptureBuffer::for_words(4096).unwrap();
        assert_eq!(buffer.len(), 16384);
        assert_eq!(buffer.word_count(), 4096);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));

        assert!(CaptureBuffer::new(0).is_err());
        assert!(CaptureBuffer::new(10).is_err());
    }

    #[test]
    fn test_chunk_mut_and_reset() {
        let mut buffer = CaptureBuffer::new(8).unwrap();
        let chunk = Chunk { index: 1, offset: 4, len: 4 };
        buffer.chunk_mut(&chunk).copy_from_slice(&[1, 2, 3, 4]);

        assert_eq!(buffer.as_slice(), &[0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(buffer.head(2), &[0, 0]);
        assert_eq!(buffer.head(100).len(), 8);

        buffer.reset();
        assert_eq!(buffer.as_slice(), &[0u8; 8]);
    }
}
