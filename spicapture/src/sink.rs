/*!
Persistence of captured payloads.
*/

use crate::config::{OutputConfig, OutputFormat, OutputLayout};
use anyhow::{Context, Result};
use shared::{CaptureBuffer, WordBuffer};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Receives each completed transaction
pub trait CaptureSink {
    /// Store one transaction; returns where it went
    fn persist(&mut self, transaction: u64, capture: &CaptureBuffer, words: &WordBuffer) -> Result<PathBuf>;
}

/// Writes transactions to disk as raw bytes or reassembled words
pub struct FileSink {
    path: PathBuf,
    format: OutputFormat,
    layout: OutputLayout,
    single: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, format: OutputFormat, layout: OutputLayout) -> Self {
        Self {
            path: path.into(),
            format,
            layout,
            single: None,
        }
    }

    pub fn from_config(config: &OutputConfig) -> Self {
        Self::new(&config.path, config.format, config.layout)
    }

    /// File a given transaction lands in: `capture.bin` -> `capture_0003.bin`
    pub fn transaction_path(&self, transaction: u64) -> PathBuf {
        match self.layout {
            OutputLayout::Single => self.path.clone(),
            OutputLayout::PerTransaction => numbered_path(&self.path, transaction),
        }
    }

    fn payload(&self, capture: &CaptureBuffer, words: &WordBuffer) -> Vec<u8> {
        match self.format {
            OutputFormat::Raw => capture.as_slice().to_vec(),
            OutputFormat::Words => words.to_le_bytes(),
        }
    }
}

fn numbered_path(path: &Path, transaction: u64) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("capture");
    let filename = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_{:04}.{}", stem, transaction, ext),
        None => format!("{}_{:04}", stem, transaction),
    };
    path.with_file_name(filename)
}

impl CaptureSink for FileSink {
    fn persist(&mut self, transaction: u64, capture: &CaptureBuffer, words: &WordBuffer) -> Result<PathBuf> {
        let data = self.payload(capture, words);
        let target = self.transaction_path(transaction);

        match self.layout {
            OutputLayout::PerTransaction => {
                std::fs::write(&target, &data)
                    .with_context(|| format!("Failed to write capture file: {}", target.display()))?;
            }
            OutputLayout::Single => {
                if self.single.is_none() {
                    let file = OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(&target)
                        .with_context(|| format!("Failed to open capture file: {}", target.display()))?;
                    self.single = Some(BufWriter::new(file));
                }

                if let Some(writer) = self.single.as_mut() {
                    writer
                        .write_all(&data)
                        .and_then(|_| writer.flush())
                        .with_context(|| format!("Failed to append to capture file: {}", target.display()))?;
                }
            }
        }

        info!("💾 Transaction #{} saved to {} ({:.1} KB)",
              transaction, target.display(), data.len() as f64 / 1024.0);

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Chunk;
    use tempfile::TempDir;

    fn capture_of(words: &[u32]) -> (CaptureBuffer, WordBuffer) {
        let mut capture = CaptureBuffer::for_words(words.len()).unwrap();
        let chunk = Chunk { index: 0, offset: 0, len: capture.len() };
        capture
            .chunk_mut(&chunk)
            .copy_from_slice(&WordBuffer::from(words.to_vec()).to_le_bytes());

        let mut assembled = WordBuffer::for_capture(&capture);
        assembled.assemble_from(&capture);
        (capture, assembled)
    }

    #[test]
    fn test_numbered_paths() {
        assert_eq!(numbered_path(Path::new("out/capture.bin"), 3), PathBuf::from("out/capture_0003.bin"));
        assert_eq!(numbered_path(Path::new("dump"), 12), PathBuf::from("dump_0012"));
    }

    #[test]
    fn test_per_transaction_words() {
        let dir = TempDir::new().unwrap();
        let mut sink = FileSink::new(dir.path().join("capture.bin"), OutputFormat::Words, OutputLayout::PerTransaction);
        let (capture, words) = capture_of(&[0x0403_0201, 0x0807_0605]);

        let first = sink.persist(1, &capture, &words).unwrap();
        let second = sink.persist(2, &capture, &words).unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(second.ends_with("capture_0002.bin"));
    }

    #[test]
    fn test_single_file_appends_raw() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.bin");
        std::fs::write(&path, b"stale contents").unwrap();

        let mut sink = FileSink::new(&path, OutputFormat::Raw, OutputLayout::Single);
        let (a, a_words) = capture_of(&[2, 4]);
        let (b, b_words) = capture_of(&[1, 3]);

        sink.persist(1, &a, &a_words).unwrap();
        sink.persist(2, &b, &b_words).unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 16);
        assert_eq!(shared::assemble(&written), vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_unwritable_target_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut sink = FileSink::new(
            dir.path().join("missing").join("capture.bin"),
            OutputFormat::Words,
            OutputLayout::PerTransaction,
        );
        let (capture, words) = capture_of(&[0]);

        let err = sink.persist(1, &capture, &words).unwrap_err();
        assert!(err.to_string().contains("Failed to write capture file"));
    }
}
