/*!
Configuration management for the SPI capture application.
*/

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use shared::protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_WORD_COUNT, PARITY_SAMPLE_COUNT};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Clock band the peripheral has been run at
const OBSERVED_CLOCK_RANGE_HZ: std::ops::RangeInclusive<u32> = 8_000_000..=32_000_000;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Reject settings no session could run with
    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.word_count == 0 {
            bail!("capture.word_count must be greater than zero");
        }
        if capture.total_bytes().is_none() {
            bail!("capture.word_count ({}) is too large to buffer", capture.word_count);
        }
        if capture.chunk_size == 0 {
            bail!("capture.chunk_size must be greater than zero");
        }
        if capture.parity_sample_count > capture.word_count {
            bail!(
                "capture.parity_sample_count ({}) exceeds capture.word_count ({})",
                capture.parity_sample_count, capture.word_count
            );
        }

        if self.device.clock_speed_hz == 0 {
            bail!("device.clock_speed_hz must be greater than zero");
        }
        if !OBSERVED_CLOCK_RANGE_HZ.contains(&self.device.clock_speed_hz) {
            warn!("⚠️ SPI clock {} Hz is outside the 8-32 MHz range the peripheral is known to handle",
                  self.device.clock_speed_hz);
        }

        if self.handshake.poll_interval_ms == 0 {
            bail!("handshake.poll_interval_ms must be greater than zero");
        }

        if self.output.enabled && self.output.path.trim().is_empty() {
            bail!("output.path must be set when output is enabled");
        }

        Ok(())
    }
}

/// Transaction and transfer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Transactions to capture before stopping (0 = until timeout or Ctrl+C)
    pub transaction_limit: u32,

    /// 32-bit words the peripheral emits per transaction
    pub word_count: usize,

    /// Bytes per bus operation
    pub chunk_size: usize,

    /// Pause between chunks in microseconds
    pub inter_chunk_delay_us: u64,

    /// Pause between transactions in milliseconds
    pub inter_transaction_delay_ms: u64,

    /// Overall session timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout_secs: Option<u64>,

    /// Log the head of every received buffer
    pub echo_buffer: bool,

    /// Leading words inspected by the parity check
    pub parity_sample_count: usize,
}

impl CaptureConfig {
    /// Bytes per transaction, `None` when the word count overflows
    pub fn total_bytes(&self) -> Option<usize> {
        self.word_count.checked_mul(shared::protocol::WORD_SIZE_BYTES)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            transaction_limit: 10,
            word_count: DEFAULT_WORD_COUNT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            inter_chunk_delay_us: 5000,
            inter_transaction_delay_ms: 1000,
            session_timeout_secs: None,
            echo_buffer: false,
            parity_sample_count: PARITY_SAMPLE_COUNT,
        }
    }
}

/// Bus and GPIO settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// spidev character device
    pub spi_device: String,

    /// SPI clock in Hz
    pub clock_speed_hz: u32,

    /// Shift least-significant bit first
    pub lsb_first: bool,

    /// GPIO character device
    pub gpio_chip: String,

    /// Line offset of the data-ready input
    pub ready_pin: u32,

    /// Consumer label shown by gpioinfo
    pub consumer_label: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            spi_device: "/dev/spidev0.0".to_string(),
            clock_speed_hz: 8_000_000,
            lsb_first: false,
            gpio_chip: "/dev/gpiochip0".to_string(),
            ready_pin: 25,
            consumer_label: "spicapture".to_string(),
        }
    }
}

/// Ready-line polling and timeout settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub poll_interval_ms: u64,

    /// Recheck delay confirming a HIGH reading
    pub ready_debounce_ms: u64,

    /// Recheck delay confirming a LOW reading
    pub complete_debounce_ms: u64,

    /// Bound on the wait for HIGH; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_timeout_ms: Option<u64>,

    /// Bound on the wait for LOW after a transfer
    pub complete_timeout_ms: u64,

    /// How often a long wait logs its progress
    pub status_interval_secs: u64,
}

impl HandshakeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_debounce(&self) -> Duration {
        Duration::from_millis(self.ready_debounce_ms)
    }

    pub fn complete_debounce(&self) -> Duration {
        Duration::from_millis(self.complete_debounce_ms)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    pub fn complete_timeout(&self) -> Duration {
        Duration::from_millis(self.complete_timeout_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            ready_debounce_ms: 10,
            complete_debounce_ms: 20,
            ready_timeout_ms: None,
            complete_timeout_ms: 10_000,
            status_interval_secs: 5,
        }
    }
}

/// What gets written for each captured transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Received bytes exactly as clocked in
    Raw,
    /// Reassembled 32-bit words, little-endian
    Words,
}

/// How transactions map to files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// One numbered file per transaction
    PerTransaction,
    /// All transactions appended to one file
    Single,
}

/// Persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub enabled: bool,
    pub path: String,
    pub format: OutputFormat,
    pub layout: OutputLayout,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "capture.bin".to_string(),
            format: OutputFormat::Words,
            layout: OutputLayout::PerTransaction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let mut original_config = AppConfig::new();
        original_config.capture.session_timeout_secs = Some(120);
        original_config.output.layout = OutputLayout::Single;

        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        original_config.save_to_file(temp_path).unwrap();
        let loaded_config = AppConfig::load_from_file(temp_path).unwrap();

        assert_eq!(original_config, loaded_config);
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::new();

        assert_eq!(config.capture.transaction_limit, 10);
        assert_eq!(config.capture.word_count, 4096);
        assert_eq!(config.capture.total_bytes(), Some(16384));
        assert_eq!(config.capture.chunk_size, 256);
        assert_eq!(config.capture.parity_sample_count, 10);
        assert!(config.capture.session_timeout_secs.is_none());

        assert_eq!(config.device.spi_device, "/dev/spidev0.0");
        assert_eq!(config.device.clock_speed_hz, 8_000_000);
        assert_eq!(config.device.ready_pin, 25);

        assert_eq!(config.handshake.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.handshake.complete_timeout(), Duration::from_secs(10));
        assert!(config.handshake.ready_timeout().is_none());

        assert!(config.output.enabled);
        assert_eq!(config.output.format, OutputFormat::Words);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [capture]
            chunk_size = 4096

            [device]
            clock_speed_hz = 32000000

            [output]
            format = "raw"
            layout = "single"
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.chunk_size, 4096);
        assert_eq!(config.capture.word_count, 4096);
        assert_eq!(config.device.clock_speed_hz, 32_000_000);
        assert_eq!(config.device.gpio_chip, "/dev/gpiochip0");
        assert_eq!(config.output.format, OutputFormat::Raw);
        assert_eq!(config.output.layout, OutputLayout::Single);
        assert_eq!(config.handshake.complete_debounce_ms, 20);
    }

    #[test]
    fn test_validation_rejects_unusable_settings() {
        let mut config = AppConfig::new();
        config.capture.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::new();
        config.capture.word_count = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::new();
        config.capture.word_count = 4;
        assert!(config.validate().is_err());

        let mut config = AppConfig::new();
        config.capture.word_count = usize::MAX;
        assert!(config.capture.total_bytes().is_none());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("too large"));

        let mut config = AppConfig::new();
        config.handshake.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::new();
        config.device.clock_speed_hz = 0;
        assert!(config.validate().is_err());

        // Out-of-band clocks only warn
        let mut config = AppConfig::new();
        config.device.clock_speed_hz = 1_000_000;
        assert!(config.validate().is_ok());
    }
}
