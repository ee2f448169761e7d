/*!
Device abstraction: the clocked serial link and the ready line.

The session only talks to the hardware through [`SpiLink`] and [`ReadyLine`],
which lets the same state machine run against Linux spidev/GPIO character
devices or the simulated peripheral.
*/

use std::fmt;
use std::io;
use tracing::info;

/// Logic level of a digital line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn from_value(value: u8) -> Self {
        if value == 0 {
            Self::Low
        } else {
            Self::High
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Full-duplex synchronous serial link
pub trait SpiLink {
    /// Clock `tx.len()` bytes out while clocking the same number in.
    /// `tx` and `rx` always have equal length.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8], speed_hz: u32) -> io::Result<()>;
}

/// Digital input driven by the peripheral to signal data ready
pub trait ReadyLine {
    fn level(&mut self) -> io::Result<Level>;
}

/// Errors raised while acquiring the device handles
#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("Failed to open SPI device {path}: {source}")]
    SpiOpen { path: String, source: io::Error },

    #[error("Failed to configure SPI device {path}: {source}")]
    SpiConfigure { path: String, source: io::Error },

    #[error("Failed to acquire GPIO line {pin} on {chip}: {message}")]
    Gpio { chip: String, pin: u32, message: String },

    #[cfg(not(feature = "hardware"))]
    #[error("Hardware support not compiled in (enable the `hardware` feature)")]
    Unsupported,
}

/// Both device handles, held for the lifetime of a session.
///
/// Dropping the device releases the handles, which happens on every exit
/// path of the session including aborts.
pub struct Device<S: SpiLink, L: ReadyLine> {
    pub spi: S,
    pub ready: L,
    name: String,
}

impl<S: SpiLink, L: ReadyLine> Device<S, L> {
    pub fn new(name: impl Into<String>, spi: S, ready: L) -> Self {
        let name = name.into();
        info!("🔌 Acquired device handles for {}", name);
        Self { spi, ready, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<S: SpiLink, L: ReadyLine> Drop for Device<S, L> {
    fn drop(&mut self) {
        info!("🔌 Released device handles for {}", self.name);
    }
}

#[cfg(feature = "hardware")]
pub use linux::open_linux_device;

#[cfg(feature = "hardware")]
mod linux {
    use super::{Device, DeviceError, Level, ReadyLine, SpiLink};
    use crate::config::DeviceConfig;
    use gpio_cdev::{Chip, LineHandle, LineRequestFlags};
    use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
    use std::io;
    use tracing::{debug, info};

    /// spidev character device configured for mode 0, 8-bit words
    pub struct LinuxSpi {
        dev: Spidev,
        speed_hz: u32,
    }

    impl LinuxSpi {
        pub fn open(config: &DeviceConfig) -> Result<Self, DeviceError> {
            let mut dev = Spidev::open(&config.spi_device).map_err(|source| DeviceError::SpiOpen {
                path: config.spi_device.clone(),
                source,
            })?;

            let options = SpidevOptions::new()
                .bits_per_word(8)
                .max_speed_hz(config.clock_speed_hz)
                .mode(SpiModeFlags::SPI_MODE_0)
                .lsb_first(config.lsb_first)
                .build();

            dev.configure(&options).map_err(|source| DeviceError::SpiConfigure {
                path: config.spi_device.clone(),
                source,
            })?;

            info!("📡 SPI {} at {:.1} MHz (mode 0, {} first)",
                  config.spi_device,
                  config.clock_speed_hz as f64 / 1_000_000.0,
                  if config.lsb_first { "LSB" } else { "MSB" });

            Ok(Self { dev, speed_hz: config.clock_speed_hz })
        }
    }

    impl SpiLink for LinuxSpi {
        fn transfer(&mut self, tx: &[u8], rx: &mut [u8], speed_hz: u32) -> io::Result<()> {
            if speed_hz != self.speed_hz {
                debug!("Reconfiguring SPI clock {} -> {} Hz", self.speed_hz, speed_hz);
                self.dev.configure(&SpidevOptions::new().max_speed_hz(speed_hz).build())?;
                self.speed_hz = speed_hz;
            }

            let mut transfer = SpidevTransfer::read_write(tx, rx);
            self.dev.transfer(&mut transfer)
        }
    }

    /// Ready line requested as an input through the GPIO character device
    pub struct GpioReadyLine {
        handle: LineHandle,
    }

    impl GpioReadyLine {
        pub fn open(config: &DeviceConfig) -> Result<Self, DeviceError> {
            let gpio_error = |e: gpio_cdev::Error| DeviceError::Gpio {
                chip: config.gpio_chip.clone(),
                pin: config.ready_pin,
                message: e.to_string(),
            };

            let mut chip = Chip::new(&config.gpio_chip).map_err(gpio_error)?;
            let handle = chip
                .get_line(config.ready_pin)
                .map_err(gpio_error)?
                .request(LineRequestFlags::INPUT, 0, &config.consumer_label)
                .map_err(gpio_error)?;

            info!("📍 Ready line: {} pin {}", config.gpio_chip, config.ready_pin);

            Ok(Self { handle })
        }
    }

    impl ReadyLine for GpioReadyLine {
        fn level(&mut self) -> io::Result<Level> {
            self.handle
                .get_value()
                .map(Level::from_value)
                .map_err(|e| io::Error::other(e.to_string()))
        }
    }

    /// Open and configure both handles; failure here is a setup error
    pub fn open_linux_device(config: &DeviceConfig) -> Result<Device<LinuxSpi, GpioReadyLine>, DeviceError> {
        let spi = LinuxSpi::open(config)?;
        let ready = GpioReadyLine::open(config)?;
        Ok(Device::new(config.spi_device.clone(), spi, ready))
    }
}
