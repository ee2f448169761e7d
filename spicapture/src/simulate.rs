/*!
Simulated double-buffering peripheral.

Stands in for the real device in `--simulate` runs and in tests. It keeps the
ready line low for a few samples, raises it with a fresh payload, streams that
payload out over the link and drops the line once the last byte has been
clocked. Payloads alternate between buffer A (even words `0, 2, 4, ...`) and
buffer B (odd words `1, 3, 5, ...`).
*/

use crate::device::{Device, Level, ReadyLine, SpiLink};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Behaviour knobs for the simulated peripheral
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Words per payload
    pub word_count: usize,
    /// Ready-line samples that read LOW before the next payload is raised
    pub low_samples: u32,
    /// Stop raising the line after this many payloads
    pub max_payloads: Option<u64>,
    /// Fail the n-th exchange (0-based, counted across the whole run)
    pub fail_on_exchange: Option<usize>,
    /// Keep the line HIGH after a payload drains, reloading immediately
    pub stuck_high: bool,
}

impl SimulationConfig {
    pub fn new(word_count: usize) -> Self {
        Self {
            word_count,
            low_samples: 3,
            max_payloads: None,
            fail_on_exchange: None,
            stuck_high: false,
        }
    }
}

#[derive(Debug)]
enum Phase {
    /// Line LOW; counts down the samples before the next payload
    Idle { samples_left: u32 },
    /// Line HIGH; payload bytes are clocked out from `cursor`
    Ready { cursor: usize },
    /// No more payloads will be produced
    Exhausted,
}

#[derive(Debug)]
struct PeripheralState {
    config: SimulationConfig,
    phase: Phase,
    payload: Vec<u8>,
    payloads_emitted: u64,
    exchanges: usize,
}

impl PeripheralState {
    fn load_next_payload(&mut self) {
        let parity = (self.payloads_emitted % 2) as u32;
        self.payload.clear();
        self.payload.extend(
            (0..self.config.word_count as u32).flat_map(|i| (i * 2 + parity).to_le_bytes()),
        );
        self.payloads_emitted += 1;
        self.phase = Phase::Ready { cursor: 0 };
        debug!("🧪 Simulated payload {} raised ({} parity)",
               self.payloads_emitted, if parity == 0 { "even" } else { "odd" });
    }

    fn payload_drained(&mut self) {
        let limit_reached = self
            .config
            .max_payloads
            .is_some_and(|max| self.payloads_emitted >= max);

        if limit_reached {
            self.phase = Phase::Exhausted;
        } else if self.config.stuck_high {
            self.load_next_payload();
        } else {
            self.phase = Phase::Idle { samples_left: self.config.low_samples };
        }
    }

    fn level(&mut self) -> Level {
        match &mut self.phase {
            Phase::Ready { .. } => Level::High,
            Phase::Exhausted => Level::Low,
            Phase::Idle { samples_left } => {
                if *samples_left > 0 {
                    *samples_left -= 1;
                    Level::Low
                } else {
                    self.load_next_payload();
                    Level::High
                }
            }
        }
    }

    fn exchange(&mut self, rx: &mut [u8]) -> io::Result<()> {
        let index = self.exchanges;
        self.exchanges += 1;

        if self.config.fail_on_exchange == Some(index) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated bus fault"));
        }

        let Phase::Ready { cursor } = &mut self.phase else {
            // Nothing staged: the output shift register idles at zero
            rx.fill(0);
            return Ok(());
        };

        let start = *cursor;
        let available = self.payload.len() - start;
        let n = rx.len().min(available);
        rx[..n].copy_from_slice(&self.payload[start..start + n]);
        rx[n..].fill(0);
        *cursor += n;

        if *cursor >= self.payload.len() {
            self.payload_drained();
        }

        Ok(())
    }
}

/// Handle counter shared by every handle the peripheral hands out
#[derive(Debug)]
struct HandleGuard {
    open: Arc<AtomicUsize>,
}

impl HandleGuard {
    fn acquire(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self { open: Arc::clone(open) }
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock(state: &Mutex<PeripheralState>) -> io::Result<MutexGuard<'_, PeripheralState>> {
    state.lock().map_err(|_| io::Error::other("simulated peripheral state poisoned"))
}

/// The peripheral itself; hands out link and line handles onto shared state
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    state: Arc<Mutex<PeripheralState>>,
    open_handles: Arc<AtomicUsize>,
}

impl SimulatedPeripheral {
    pub fn new(config: SimulationConfig) -> Self {
        let samples_left = config.low_samples;
        let phase = if config.max_payloads == Some(0) {
            Phase::Exhausted
        } else {
            Phase::Idle { samples_left }
        };

        Self {
            state: Arc::new(Mutex::new(PeripheralState {
                payload: Vec::with_capacity(config.word_count * 4),
                config,
                phase,
                payloads_emitted: 0,
                exchanges: 0,
            })),
            open_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn spi(&self) -> SimulatedSpi {
        SimulatedSpi {
            state: Arc::clone(&self.state),
            _guard: HandleGuard::acquire(&self.open_handles),
        }
    }

    pub fn ready_line(&self) -> SimulatedReadyLine {
        SimulatedReadyLine {
            state: Arc::clone(&self.state),
            _guard: HandleGuard::acquire(&self.open_handles),
        }
    }

    /// Both handles packaged as a device
    pub fn device(&self) -> Device<SimulatedSpi, SimulatedReadyLine> {
        info!("🧪 Using simulated peripheral");
        Device::new("simulated peripheral", self.spi(), self.ready_line())
    }

    /// Handles that have been handed out and not yet dropped
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub fn payloads_emitted(&self) -> u64 {
        lock(&self.state).map(|s| s.payloads_emitted).unwrap_or(0)
    }
}

/// Link side of the simulated peripheral
#[derive(Debug)]
pub struct SimulatedSpi {
    state: Arc<Mutex<PeripheralState>>,
    _guard: HandleGuard,
}

impl SpiLink for SimulatedSpi {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8], _speed_hz: u32) -> io::Result<()> {
        if tx.len() != rx.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tx and rx lengths differ"));
        }
        lock(&self.state)?.exchange(rx)
    }
}

/// Ready-line side of the simulated peripheral
#[derive(Debug)]
pub struct SimulatedReadyLine {
    state: Arc<Mutex<PeripheralState>>,
    _guard: HandleGuard,
}

impl ReadyLine for SimulatedReadyLine {
    fn level(&mut self) -> io::Result<Level> {
        Ok(lock(&self.state)?.level())
    }
}
