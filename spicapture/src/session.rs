/*!
Capture session state machine.

One session drives repeated handshake-and-transfer cycles against a single
peripheral:

```text
Idle -> AwaitReady -> Transferring -> AwaitComplete -> Idle ...
  |         |              |               |
  v         v              v               v
 Done    Aborted        Aborted          Done (cancelled)
```

Every error kind is resolved here. Collaborators (CLI, persistence) only see
the final [`SessionReport`].
*/

use crate::cancel::CancellationToken;
use crate::config::AppConfig;
use crate::device::{Device, Level, ReadyLine, SpiLink};
use crate::monitor::{SignalMonitor, WaitError};
use crate::sink::CaptureSink;
use crate::transfer::{TransferEngine, TransferError};
use chrono::{DateTime, Local};
use serde::Serialize;
use shared::protocol::{ECHO_BYTES, ECHO_WORDS};
use shared::{classify, CaptureBuffer, ValidationResult, WordBuffer};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Session-level knobs, resolved from [`AppConfig`]
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// 0 means no limit
    pub transaction_limit: u32,
    pub word_count: usize,
    pub session_timeout: Option<Duration>,
    pub ready_debounce: Duration,
    pub ready_timeout: Option<Duration>,
    pub complete_debounce: Duration,
    pub complete_timeout: Duration,
    pub inter_transaction_delay: Duration,
    pub echo_buffer: bool,
    pub parity_sample_count: usize,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            transaction_limit: config.capture.transaction_limit,
            word_count: config.capture.word_count,
            session_timeout: config.capture.session_timeout_secs.map(Duration::from_secs),
            ready_debounce: config.handshake.ready_debounce(),
            ready_timeout: config.handshake.ready_timeout(),
            complete_debounce: config.handshake.complete_debounce(),
            complete_timeout: config.handshake.complete_timeout(),
            inter_transaction_delay: Duration::from_millis(config.capture.inter_transaction_delay_ms),
            echo_buffer: config.capture.echo_buffer,
            parity_sample_count: config.capture.parity_sample_count,
        }
    }
}

/// Why a session finished cleanly
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    TransactionLimit,
    SessionTimeout,
    Cancelled,
}

/// Why a session gave up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// No positive handshake within the ready bound
    ReadyTimeout { waited_ms: u64 },
    /// A bus operation failed mid-transfer
    TransferFailed { transaction: u64, bytes_transferred: usize, message: String },
    /// The ready line could not be read
    LineFault { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum SessionOutcome {
    Done(DoneReason),
    Aborted(AbortReason),
}

impl SessionOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

/// States of the capture cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitReady,
    Transferring,
    AwaitComplete,
    Done(DoneReason),
    Aborted(AbortReason),
}

/// One handshake+transfer series: counter, start time and overall budget
#[derive(Debug)]
pub struct TransferSession {
    transaction: u64,
    started_at: DateTime<Local>,
    started: Instant,
    timeout: Option<Duration>,
}

impl TransferSession {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            transaction: 0,
            started_at: Local::now(),
            started: Instant::now(),
            timeout,
        }
    }

    /// Number of the transaction in flight (or last attempted)
    pub fn transaction(&self) -> u64 {
        self.transaction
    }

    fn begin_transaction(&mut self) -> u64 {
        self.transaction += 1;
        self.transaction
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left in the overall budget, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.timeout.map(|t| t.saturating_sub(self.elapsed()))
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }
}

/// End-of-session summary handed back to the caller
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub started_at: String,
    pub outcome: SessionOutcome,
    pub transactions_completed: u64,
    pub bytes_captured: u64,
    pub elapsed_secs: f64,
    pub throughput_mb_per_sec: f64,
    pub throughput_mbps: f64,
    pub buffers_even: u64,
    pub buffers_odd: u64,
    pub buffers_mixed: u64,
    pub ready_low_timeouts: u64,
    pub persistence_failures: u64,
    pub glitches_rejected: u64,
}

#[derive(Debug, Default)]
struct Tally {
    completed: u64,
    bytes_captured: u64,
    even: u64,
    odd: u64,
    mixed: u64,
    ready_low_timeouts: u64,
    persistence_failures: u64,
}

/// Drives the capture cycle against one device
pub struct SessionController<S: SpiLink, L: ReadyLine> {
    device: Device<S, L>,
    settings: SessionSettings,
    monitor: SignalMonitor,
    engine: TransferEngine,
    sink: Option<Box<dyn CaptureSink>>,
    cancel: CancellationToken,
    session: TransferSession,
    capture: CaptureBuffer,
    words: WordBuffer,
    tally: Tally,
}

impl<S: SpiLink, L: ReadyLine> SessionController<S, L> {
    /// Build a controller; buffers are sized once here and reused for every transaction
    pub fn new(
        device: Device<S, L>,
        settings: SessionSettings,
        monitor: SignalMonitor,
        engine: TransferEngine,
        sink: Option<Box<dyn CaptureSink>>,
        cancel: CancellationToken,
    ) -> shared::Result<Self> {
        let capture = CaptureBuffer::for_words(settings.word_count)?;
        let words = WordBuffer::for_capture(&capture);
        let session = TransferSession::new(settings.session_timeout);

        Ok(Self {
            device,
            settings,
            monitor,
            engine,
            sink,
            cancel,
            session,
            capture,
            words,
            tally: Tally::default(),
        })
    }

    /// Build a controller with every component configured from `config`
    pub fn from_config(
        device: Device<S, L>,
        config: &AppConfig,
        sink: Option<Box<dyn CaptureSink>>,
        cancel: CancellationToken,
    ) -> shared::Result<Self> {
        let monitor = SignalMonitor::new(config.handshake.poll_interval(), config.handshake.status_interval());
        let engine = TransferEngine::new(
            config.capture.chunk_size,
            config.device.clock_speed_hz,
            Duration::from_micros(config.capture.inter_chunk_delay_us),
        );

        Self::new(device, SessionSettings::from_config(config), monitor, engine, sink, cancel)
    }

    /// Run the session to completion.
    ///
    /// Consumes the controller so the device handles are released before
    /// this returns, whatever the outcome.
    pub fn run(mut self) -> SessionReport {
        info!("🚀 Capture session started on {} ({} bytes per transaction, limit: {})",
              self.device.name(),
              self.capture.len(),
              match self.settings.transaction_limit {
                  0 => "none".to_string(),
                  n => n.to_string(),
              });

        let mut state = SessionState::Idle;
        let outcome = loop {
            debug!("Session state: {:?}", state);
            state = match state {
                SessionState::Idle => self.on_idle(),
                SessionState::AwaitReady => self.on_await_ready(),
                SessionState::Transferring => self.on_transferring(),
                SessionState::AwaitComplete => self.on_await_complete(),
                SessionState::Done(reason) => break SessionOutcome::Done(reason),
                SessionState::Aborted(reason) => break SessionOutcome::Aborted(reason),
            };
        };

        let report = self.report(outcome);
        log_report(&report);
        report
    }

    fn on_idle(&mut self) -> SessionState {
        let limit = self.settings.transaction_limit;
        if limit > 0 && self.tally.completed >= u64::from(limit) {
            return SessionState::Done(DoneReason::TransactionLimit);
        }
        if self.session.expired() {
            info!("⏰ Session timeout reached");
            return SessionState::Done(DoneReason::SessionTimeout);
        }
        if self.cancel.is_cancelled() {
            return SessionState::Done(DoneReason::Cancelled);
        }

        info!("⏳ Waiting for data ready signal (HIGH)...");
        SessionState::AwaitReady
    }

    fn on_await_ready(&mut self) -> SessionState {
        let bound = match (self.settings.ready_timeout, self.session.remaining()) {
            (Some(ready), Some(session)) => Some(ready.min(session)),
            (ready, session) => ready.or(session),
        };

        let waited = self.monitor.wait_for_level(
            &mut self.device.ready,
            Level::High,
            self.settings.ready_debounce,
            bound,
            &self.cancel,
        );

        match waited {
            Ok(_) => {
                let transaction = self.session.begin_transaction();
                info!("📥 Transaction #{} - data ready HIGH detected", transaction);
                SessionState::Transferring
            }
            Err(WaitError::Timeout { .. }) if self.session.expired() => {
                info!("⏰ Session timeout reached while waiting for data ready");
                SessionState::Done(DoneReason::SessionTimeout)
            }
            Err(WaitError::Timeout { waited, .. }) => {
                error!("❌ No data ready signal within {:.1}s", waited.as_secs_f64());
                let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
                SessionState::Aborted(AbortReason::ReadyTimeout { waited_ms })
            }
            Err(WaitError::Cancelled) => SessionState::Done(DoneReason::Cancelled),
            Err(WaitError::Line(e)) => {
                error!("❌ Ready line fault: {}", e);
                SessionState::Aborted(AbortReason::LineFault { message: e.to_string() })
            }
        }
    }

    fn on_transferring(&mut self) -> SessionState {
        let transaction = self.session.transaction();

        let stats = match self.engine.exchange(&mut self.device.spi, &mut self.capture, &self.cancel) {
            Ok(stats) => stats,
            Err(TransferError::Cancelled { bytes_transferred }) => {
                warn!("⚠️ Transaction #{} cancelled after {} bytes", transaction, bytes_transferred);
                return SessionState::Done(DoneReason::Cancelled);
            }
            Err(e) => {
                // A short read leaves host and peripheral out of step; no retry without a fresh handshake
                error!("❌ Transaction #{}: {}", transaction, e);
                return SessionState::Aborted(AbortReason::TransferFailed {
                    transaction,
                    bytes_transferred: e.bytes_transferred(),
                    message: e.to_string(),
                });
            }
        };

        info!("✅ Transfer complete: {} bytes in {:.2} ms ({:.2} KB/s, slowest chunk {:.3} ms)",
              stats.bytes_transferred, stats.duration.as_secs_f64() * 1000.0, stats.throughput_kbps(),
              stats.slowest_chunk.as_secs_f64() * 1000.0);

        let convert_start = Instant::now();
        self.words.assemble_from(&self.capture);
        debug!("Conversion to {} words: {:.3} ms", self.words.len(), convert_start.elapsed().as_secs_f64() * 1000.0);

        if self.settings.echo_buffer {
            self.echo();
        }

        let validation = classify(self.words.as_slice(), self.settings.parity_sample_count);
        match &validation {
            ValidationResult::AllEven => {
                self.tally.even += 1;
                info!("🔍 Detected {}", validation);
            }
            ValidationResult::AllOdd => {
                self.tally.odd += 1;
                info!("🔍 Detected {}", validation);
            }
            ValidationResult::Mixed { .. } => {
                self.tally.mixed += 1;
                warn!("⚠️ Received data does not match expected pattern: {}", validation);
            }
        }

        self.tally.bytes_captured += stats.bytes_transferred as u64;
        SessionState::AwaitComplete
    }

    fn on_await_complete(&mut self) -> SessionState {
        let transaction = self.session.transaction();
        info!("⏳ Waiting for peripheral to signal completion (LOW)...");

        let waited = self.monitor.wait_for_level(
            &mut self.device.ready,
            Level::Low,
            self.settings.complete_debounce,
            Some(self.settings.complete_timeout),
            &self.cancel,
        );

        match waited {
            Ok(_) => info!("✅ Data ready LOW - transaction #{} complete", transaction),
            Err(WaitError::Timeout { waited, .. }) => {
                // The peripheral recovers on its own; stalling here would stall the whole session
                warn!("⚠️ Timeout waiting for data ready LOW after {:.1}s, continuing", waited.as_secs_f64());
                if let (Some(level), Some(changed)) = (self.monitor.last_level(), self.monitor.last_change()) {
                    debug!("Ready line {} since {:.1}s ago", level, changed.elapsed().as_secs_f64());
                }
                self.tally.ready_low_timeouts += 1;
            }
            Err(WaitError::Cancelled) => return SessionState::Done(DoneReason::Cancelled),
            Err(WaitError::Line(e)) => {
                error!("❌ Ready line fault: {}", e);
                return SessionState::Aborted(AbortReason::LineFault { message: e.to_string() });
            }
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.persist(transaction, &self.capture, &self.words) {
                error!("❌ Failed to save transaction #{}: {:#}", transaction, e);
                self.tally.persistence_failures += 1;
            }
        }

        self.tally.completed += 1;

        let limit_reached = self.settings.transaction_limit > 0
            && self.tally.completed >= u64::from(self.settings.transaction_limit);
        if !limit_reached && !self.settings.inter_transaction_delay.is_zero() {
            debug!("Ready for next transaction");
            if self.cancel.sleep(self.settings.inter_transaction_delay).is_err() {
                return SessionState::Done(DoneReason::Cancelled);
            }
        }

        SessionState::Idle
    }

    fn echo(&self) {
        let bytes = self.capture.head(ECHO_BYTES);
        let words: Vec<String> = self
            .words
            .as_slice()
            .iter()
            .take(ECHO_WORDS)
            .map(|w| w.to_string())
            .collect();

        info!("   First {} bytes: {}", bytes.len(), hex::encode_upper(bytes));
        info!("   First {} words: {}", words.len(), words.join(" "));
    }

    fn report(&self, outcome: SessionOutcome) -> SessionReport {
        let elapsed = self.session.elapsed().as_secs_f64();
        let bytes = self.tally.bytes_captured as f64;
        let (mb_per_sec, mbps) = if elapsed > 0.0 {
            (bytes / (elapsed * 1024.0 * 1024.0), (bytes * 8.0) / (elapsed * 1_000_000.0))
        } else {
            (0.0, 0.0)
        };

        SessionReport {
            started_at: self.session.started_at().to_rfc3339(),
            outcome,
            transactions_completed: self.tally.completed,
            bytes_captured: self.tally.bytes_captured,
            elapsed_secs: elapsed,
            throughput_mb_per_sec: mb_per_sec,
            throughput_mbps: mbps,
            buffers_even: self.tally.even,
            buffers_odd: self.tally.odd,
            buffers_mixed: self.tally.mixed,
            ready_low_timeouts: self.tally.ready_low_timeouts,
            persistence_failures: self.tally.persistence_failures,
            glitches_rejected: self.monitor.glitches_rejected(),
        }
    }
}

fn log_report(report: &SessionReport) {
    match &report.outcome {
        SessionOutcome::Done(reason) => info!("🏁 Session finished: {:?}", reason),
        SessionOutcome::Aborted(reason) => error!("🛑 Session aborted: {:?}", reason),
    }

    info!("📊 Capture summary:");
    info!("   Transactions: {}", report.transactions_completed);
    info!("   Total received: {} bytes", report.bytes_captured);
    info!("   Time elapsed: {:.2} seconds", report.elapsed_secs);
    info!("   Throughput: {:.2} MB/s ({:.2} Mbps)", report.throughput_mb_per_sec, report.throughput_mbps);
    info!("   Buffers: {} even, {} odd, {} mixed", report.buffers_even, report.buffers_odd, report.buffers_mixed);
    info!("   Ready-low timeouts: {}", report.ready_low_timeouts);
    info!("   Persistence failures: {}", report.persistence_failures);
    info!("   Glitches rejected: {}", report.glitches_rejected);
}
