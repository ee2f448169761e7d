/*!
Byte-to-word reassembly.

The peripheral shifts each 32-bit word out least-significant byte first, so
word `i` is `bytes[4i] | bytes[4i+1] << 8 | bytes[4i+2] << 16 | bytes[4i+3] << 24`.
Any other byte order is a compatibility break with the device.
*/

use crate::buffer::CaptureBuffer;
use crate::protocol::WORD_SIZE_BYTES;

/// Reassemble little-endian words from raw bytes.
///
/// Trailing bytes that do not form a whole word are ignored; callers hand in
/// buffers that are already a multiple of the word size.
pub fn assemble(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(WORD_SIZE_BYTES)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Owned word sequence derived from a [`CaptureBuffer`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WordBuffer {
    words: Vec<u32>,
}

impl WordBuffer {
    /// Create an empty buffer sized for `capture`
    pub fn for_capture(capture: &CaptureBuffer) -> Self {
        Self {
            words: Vec::with_capacity(capture.word_count()),
        }
    }

    /// Overwrite this buffer with the words of `capture`, reusing the allocation
    pub fn assemble_from(&mut self, capture: &CaptureBuffer) {
        self.words.clear();
        self.words.extend(
            capture
                .as_slice()
                .chunks_exact(WORD_SIZE_BYTES)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.words
    }

    /// Serialize the words back to the peripheral's little-endian layout
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

impl From<Vec<u32>> for WordBuffer {
    fn from(words: Vec<u32>) -> Self {
        Self { words }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_order_is_little_endian() {
        let bytes = [0x78, 0x56, 0x34, 0x12, 0x01, 0x00, 0x00, 0x80];
        assert_eq!(assemble(&bytes), vec![0x1234_5678, 0x8000_0001]);
    }

    #[test]
    fn test_known_words_survive_capture() {
        for word_count in [1usize, 2, 7, 4096] {
            let original: Vec<u32> = (0..word_count as u32)
                .map(|i| i.wrapping_mul(0x9E37_79B9) ^ 0xA5A5_0F0F)
                .collect();

            let mut capture = CaptureBuffer::for_words(word_count).unwrap();
            let plan = crate::ChunkPlan::new(capture.len(), capture.len()).unwrap();
            let chunk = plan.chunks().next().unwrap();
            let encoded = WordBuffer::from(original.clone()).to_le_bytes();
            capture.chunk_mut(&chunk).copy_from_slice(&encoded);

            let mut words = WordBuffer::for_capture(&capture);
            words.assemble_from(&capture);

            assert_eq!(words.as_slice(), original.as_slice());
            assert_eq!(words.len() * WORD_SIZE_BYTES, capture.len());
        }
    }

    #[test]
    fn test_assemble_from_reuses_buffer() {
        let mut capture = CaptureBuffer::new(8).unwrap();
        let mut words = WordBuffer::for_capture(&capture);

        words.assemble_from(&capture);
        assert_eq!(words.as_slice(), &[0, 0]);

        let chunk = crate::Chunk { index: 0, offset: 0, len: 4 };
        capture.chunk_mut(&chunk).copy_from_slice(&[2, 0, 0, 0]);
        words.assemble_from(&capture);
        assert_eq!(words.as_slice(), &[2, 0]);
    }

    #[test]
    fn test_partial_trailing_word_ignored() {
        assert_eq!(assemble(&[1, 0, 0, 0, 9, 9]), vec![1]);
        assert!(assemble(&[]).is_empty());
    }
}
