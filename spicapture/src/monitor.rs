/*!
Debounced observation of the data-ready line.

A level only counts once a second sample, taken after the debounce window,
agrees with the first. A single reading that reverts before the recheck is
treated as bounce and the wait carries on.
*/

use crate::cancel::CancellationToken;
use crate::device::{Level, ReadyLine};
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Why a wait ended without seeing the target level
#[derive(Error, Debug)]
pub enum WaitError {
    #[error("Timed out after {waited:?} waiting for ready line {target}")]
    Timeout { target: Level, waited: Duration },

    #[error("Wait cancelled")]
    Cancelled,

    #[error("Ready line read failed: {0}")]
    Line(#[from] io::Error),
}

/// Ready-line monitor with explicit polling configuration and level bookkeeping
#[derive(Debug)]
pub struct SignalMonitor {
    poll_interval: Duration,
    status_interval: Duration,
    last_level: Option<Level>,
    last_change: Option<Instant>,
    glitches_rejected: u64,
}

impl SignalMonitor {
    pub fn new(poll_interval: Duration, status_interval: Duration) -> Self {
        Self {
            poll_interval,
            status_interval,
            last_level: None,
            last_change: None,
            glitches_rejected: 0,
        }
    }

    /// Most recent sampled level
    pub fn last_level(&self) -> Option<Level> {
        self.last_level
    }

    /// When the sampled level last changed
    pub fn last_change(&self) -> Option<Instant> {
        self.last_change
    }

    /// Readings that matched the target but failed the debounce recheck
    pub fn glitches_rejected(&self) -> u64 {
        self.glitches_rejected
    }

    /// Block until the line settles at `target`.
    ///
    /// `timeout = None` waits indefinitely. The deadline is checked between
    /// polls, so a wait can overrun it by at most one debounce window.
    pub fn wait_for_level<L: ReadyLine>(
        &mut self,
        line: &mut L,
        target: Level,
        debounce: Duration,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Duration, WaitError> {
        let start = Instant::now();
        let mut last_status = start;

        loop {
            cancel.check().map_err(|_| WaitError::Cancelled)?;

            let level = self.sample(line)?;
            if level == target {
                cancel.sleep(debounce).map_err(|_| WaitError::Cancelled)?;

                if self.sample(line)? == target {
                    let waited = start.elapsed();
                    debug!("Ready line {} confirmed after {:?}", target, waited);
                    return Ok(waited);
                }

                self.glitches_rejected += 1;
                debug!("Ready line {} reverted within {:?}, ignoring", target, debounce);
            }

            let elapsed = start.elapsed();
            let remaining = match timeout {
                Some(limit) if elapsed >= limit => {
                    return Err(WaitError::Timeout { target, waited: elapsed });
                }
                Some(limit) => Some(limit - elapsed),
                None => None,
            };

            if !self.status_interval.is_zero() && last_status.elapsed() >= self.status_interval {
                info!("⏳ Still waiting for ready line {}... current: {} ({:.1}s)",
                      target, level, elapsed.as_secs_f64());
                last_status = Instant::now();
            }

            let pause = remaining.map_or(self.poll_interval, |r| r.min(self.poll_interval));
            cancel.sleep(pause).map_err(|_| WaitError::Cancelled)?;
        }
    }

    fn sample<L: ReadyLine>(&mut self, line: &mut L) -> Result<Level, WaitError> {
        let level = line.level()?;

        if self.last_level != Some(level) {
            self.last_level = Some(level);
            self.last_change = Some(Instant::now());
        }

        Ok(level)
    }
}
