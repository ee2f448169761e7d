/*!
Chunked full-duplex transfer engine.

The peripheral free-runs its output on any clock activity, so the transmit
side of every exchange is a zero filler and only the received bytes matter.
*/

use crate::cancel::CancellationToken;
use crate::device::SpiLink;
use shared::{CaptureBuffer, ChunkPlan};
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Errors that end an exchange early
#[derive(Error, Debug)]
pub enum TransferError {
    /// A bus operation failed; bytes before `bytes_transferred` are intact
    #[error("SPI transfer failed at chunk {chunk} after {bytes_transferred} bytes: {source}")]
    Failed {
        chunk: usize,
        bytes_transferred: usize,
        source: io::Error,
    },

    #[error("Transfer cancelled after {bytes_transferred} bytes")]
    Cancelled { bytes_transferred: usize },

    #[error("Invalid transfer plan: {0}")]
    Plan(#[from] shared::SharedError),
}

impl TransferError {
    /// Bytes safely copied before the transfer stopped
    pub fn bytes_transferred(&self) -> usize {
        match self {
            Self::Failed { bytes_transferred, .. } | Self::Cancelled { bytes_transferred } => *bytes_transferred,
            Self::Plan(_) => 0,
        }
    }
}

/// Timing of one completed exchange
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStats {
    pub bytes_transferred: usize,
    pub chunks: usize,
    pub duration: Duration,
    pub slowest_chunk: Duration,
}

impl TransferStats {
    /// Throughput in KiB per second
    pub fn throughput_kbps(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            (self.bytes_transferred as f64 / 1024.0) / secs
        } else {
            0.0
        }
    }
}

/// Moves a capture buffer's worth of bytes in bounded chunks
#[derive(Debug)]
pub struct TransferEngine {
    chunk_size: usize,
    clock_speed_hz: u32,
    inter_chunk_delay: Duration,
    tx_filler: Vec<u8>,
    last_reported_pct: Option<usize>,
}

impl TransferEngine {
    pub fn new(chunk_size: usize, clock_speed_hz: u32, inter_chunk_delay: Duration) -> Self {
        Self {
            chunk_size,
            clock_speed_hz,
            inter_chunk_delay,
            tx_filler: vec![0u8; chunk_size],
            last_reported_pct: None,
        }
    }

    /// Fill `buffer` from the link, one chunk per bus operation.
    ///
    /// Cancellation is checked before every chunk. The first failed
    /// operation aborts the exchange.
    pub fn exchange<S: SpiLink>(
        &mut self,
        spi: &mut S,
        buffer: &mut CaptureBuffer,
        cancel: &CancellationToken,
    ) -> Result<TransferStats, TransferError> {
        let plan = ChunkPlan::new(buffer.len(), self.chunk_size)?;
        let total_chunks = plan.chunk_count();

        debug!("Transferring {} bytes in {} chunks of {} bytes plus {} bytes",
               plan.total_len(), plan.full_chunks(), plan.chunk_size(), plan.remainder());

        buffer.reset();
        self.last_reported_pct = None;

        let mut bytes_transferred = 0usize;
        let mut slowest_chunk = Duration::ZERO;
        let start = Instant::now();

        for chunk in plan.chunks() {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled { bytes_transferred });
            }

            let chunk_start = Instant::now();
            spi.transfer(&self.tx_filler[..chunk.len], buffer.chunk_mut(&chunk), self.clock_speed_hz)
                .map_err(|source| TransferError::Failed {
                    chunk: chunk.index,
                    bytes_transferred,
                    source,
                })?;
            let chunk_time = chunk_start.elapsed();

            bytes_transferred += chunk.len;
            slowest_chunk = slowest_chunk.max(chunk_time);

            if chunk.index == 0 || chunk.index + 1 == total_chunks || chunk.index % 16 == 0 {
                let secs = chunk_time.as_secs_f64();
                let rate = if secs > 0.0 { (chunk.len as f64 / 1024.0) / secs } else { 0.0 };
                debug!("Chunk {}/{}: {} bytes in {:.3} ms ({:.2} KB/s)",
                       chunk.index + 1, total_chunks, chunk.len, secs * 1000.0, rate);
            }

            self.report_progress(bytes_transferred, plan.total_len());

            let is_last = chunk.index + 1 == total_chunks;
            if !is_last && !self.inter_chunk_delay.is_zero() && cancel.sleep(self.inter_chunk_delay).is_err() {
                return Err(TransferError::Cancelled { bytes_transferred });
            }
        }

        Ok(TransferStats {
            bytes_transferred,
            chunks: total_chunks,
            duration: start.elapsed(),
            slowest_chunk,
        })
    }

    /// Log progress once per 10% step
    fn report_progress(&mut self, done: usize, total: usize) {
        if total == 0 {
            return;
        }

        let pct = done * 100 / total;
        if pct > 0 && pct % 10 == 0 && self.last_reported_pct != Some(pct) {
            debug!("Progress: {}% ({}/{} bytes)", pct, done, total);
            self.last_reported_pct = Some(pct);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Link that answers with a running byte counter and records every call
    #[derive(Default)]
    struct CountingLink {
        next: u8,
        calls: Vec<usize>,
        speeds: Vec<u32>,
        fail_on_call: Option<usize>,
        cancel_after_call: Option<(usize, CancellationToken)>,
    }

    impl SpiLink for CountingLink {
        fn transfer(&mut self, tx: &[u8], rx: &mut [u8], speed_hz: u32) -> io::Result<()> {
            assert_eq!(tx.len(), rx.len());
            assert!(tx.iter().all(|&b| b == 0), "transmit side must be zero filler");

            if self.fail_on_call == Some(self.calls.len()) {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "bus stalled"));
            }

            for byte in rx.iter_mut() {
                *byte = self.next;
                self.next = self.next.wrapping_add(1);
            }
            self.calls.push(rx.len());
            self.speeds.push(speed_hz);

            if let Some((after, token)) = &self.cancel_after_call {
                if self.calls.len() == *after {
                    token.cancel();
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_full_buffer_in_chunks() {
        let mut engine = TransferEngine::new(256, 8_000_000, Duration::ZERO);
        let mut link = CountingLink::default();
        let mut buffer = CaptureBuffer::for_words(4096).unwrap();

        let stats = engine.exchange(&mut link, &mut buffer, &CancellationToken::new()).unwrap();

        assert_eq!(stats.bytes_transferred, 16384);
        assert_eq!(stats.chunks, 64);
        assert!(stats.slowest_chunk <= stats.duration);
        assert_eq!(link.calls, vec![256; 64]);
        assert!(link.speeds.iter().all(|&s| s == 8_000_000));

        let expected: Vec<u8> = (0..16384).map(|i| (i % 256) as u8).collect();
        assert_eq!(buffer.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_remainder_chunk_sent_last() {
        let mut engine = TransferEngine::new(256, 8_000_000, Duration::ZERO);
        let mut link = CountingLink::default();
        let mut buffer = CaptureBuffer::new(1000).unwrap();

        let stats = engine.exchange(&mut link, &mut buffer, &CancellationToken::new()).unwrap();

        assert_eq!(link.calls, vec![256, 256, 256, 232]);
        assert_eq!(stats.bytes_transferred, 1000);
    }

    #[test]
    fn test_failure_reports_bytes_moved() {
        let mut engine = TransferEngine::new(256, 8_000_000, Duration::ZERO);
        let mut link = CountingLink { fail_on_call: Some(3), ..Default::default() };
        let mut buffer = CaptureBuffer::for_words(4096).unwrap();

        let err = engine.exchange(&mut link, &mut buffer, &CancellationToken::new()).unwrap_err();

        match &err {
            TransferError::Failed { chunk, bytes_transferred, .. } => {
                assert_eq!(*chunk, 3);
                assert_eq!(*bytes_transferred, 768);
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(err.bytes_transferred(), 768);
        // No further operations after the failure
        assert_eq!(link.calls.len(), 3);
        // Bytes copied before the failure are still in place
        assert_eq!(buffer.as_slice()[767], 255);
    }

    #[test]
    fn test_cancellation_checked_per_chunk() {
        let cancel = CancellationToken::new();
        let mut engine = TransferEngine::new(256, 8_000_000, Duration::ZERO);
        let mut link = CountingLink { cancel_after_call: Some((2, cancel.clone())), ..Default::default() };
        let mut buffer = CaptureBuffer::for_words(4096).unwrap();

        let err = engine.exchange(&mut link, &mut buffer, &cancel).unwrap_err();

        assert!(matches!(err, TransferError::Cancelled { bytes_transferred: 512 }));
        assert_eq!(link.calls.len(), 2);
    }

    #[test]
    fn test_buffer_zeroed_before_reuse() {
        let mut engine = TransferEngine::new(4, 8_000_000, Duration::ZERO);
        let mut buffer = CaptureBuffer::new(8).unwrap();

        let mut link = CountingLink { next: 0xAA, ..Default::default() };
        engine.exchange(&mut link, &mut buffer, &CancellationToken::new()).unwrap();

        let mut failing = CountingLink { fail_on_call: Some(1), ..Default::default() };
        assert!(engine.exchange(&mut failing, &mut buffer, &CancellationToken::new()).is_err());
        assert_eq!(buffer.as_slice(), &[0, 1, 2, 3, 0, 0, 0, 0]);
    }

    #[test]
    fn test_zero_chunk_size_is_a_plan_error() {
        let mut engine = TransferEngine::new(0, 8_000_000, Duration::ZERO);
        let mut buffer = CaptureBuffer::new(8).unwrap();
        let err = engine.exchange(&mut CountingLink::default(), &mut buffer, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, TransferError::Plan(_)));
    }

    #[test]
    fn test_throughput_accounting() {
        let stats = TransferStats {
            bytes_transferred: 16384,
            chunks: 64,
            duration: Duration::from_millis(500),
            slowest_chunk: Duration::from_millis(10),
        };
        assert!((stats.throughput_kbps() - 32.0).abs() < 1e-9);

        let instant = TransferStats { duration: Duration::ZERO, ..stats };
        assert_eq!(instant.throughput_kbps(), 0.0);
    }
}
