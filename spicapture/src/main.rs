/*!
# SPI Capture Application

Host-side driver for a peripheral that raises a data-ready line and then
streams a fixed-size payload over SPI. Each transaction waits for the ready
edge, clocks the payload in chunks, reassembles it into 32-bit words, checks
the parity pattern, waits for the line to drop and saves the result.

## Usage

### Capture with explicit parameters
```bash
spicapture capture --count 10 --file capture.bin --display
```

### Capture from a configuration file
```bash
spicapture --config spicapture.toml
```

### Dry run against the simulated peripheral
```bash
spicapture capture --simulate --count 3 --no-save
```

### Exit codes

- `0` - session finished (transaction limit, session timeout, or Ctrl+C)
- `1` - configuration or device setup failed
- `2` - session aborted (no handshake, transfer failure)
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cancel;
mod config;
mod device;
mod monitor;
mod session;
mod simulate;
mod sink;
mod transfer;

use cancel::CancellationToken;
use config::{AppConfig, OutputFormat, OutputLayout};
use device::{Device, ReadyLine, SpiLink};
use session::{SessionController, SessionReport};
use simulate::{SimulatedPeripheral, SimulationConfig};
use sink::{CaptureSink, FileSink};

const EXIT_SETUP_FAILED: u8 = 1;
const EXIT_ABORTED: u8 = 2;

#[derive(Parser)]
#[command(name = "spicapture")]
#[command(about = "Handshake-driven bulk capture from an SPI peripheral")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "spicapture.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a capture session
    Capture(CaptureArgs),

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "spicapture.toml")]
        output: PathBuf,
    },
}

#[derive(clap::Args, Default)]
struct CaptureArgs {
    /// Number of transactions to capture (0 = until timeout or Ctrl+C)
    #[arg(long)]
    count: Option<u32>,

    /// Output file for captured payloads
    #[arg(long)]
    file: Option<String>,

    /// Echo the head of every received buffer
    #[arg(long)]
    display: bool,

    /// Do not save captured payloads
    #[arg(long)]
    no_save: bool,

    /// Overall session timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// SPI clock speed in Hz
    #[arg(long)]
    speed: Option<u32>,

    /// Bytes per SPI transfer
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Save raw bytes or reassembled words
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Append every transaction to one file
    #[arg(long)]
    single_file: bool,

    /// Use the simulated peripheral instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Write the session report as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

impl CaptureArgs {
    /// Apply command-line overrides on top of the loaded configuration
    fn apply(&self, config: &mut AppConfig) {
        if let Some(count) = self.count {
            config.capture.transaction_limit = count;
        }
        if let Some(file) = &self.file {
            config.output.path = file.clone();
        }
        if self.display {
            config.capture.echo_buffer = true;
        }
        if self.no_save {
            config.output.enabled = false;
        }
        if let Some(timeout) = self.timeout {
            config.capture.session_timeout_secs = Some(timeout);
        }
        if let Some(speed) = self.speed {
            config.device.clock_speed_hz = speed;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.capture.chunk_size = chunk_size;
        }
        if let Some(format) = self.format {
            config.output.format = format;
        }
        if self.single_file {
            config.output.layout = OutputLayout::Single;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logging goes to stderr; RUST_LOG overrides the default level
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let result = match cli.command {
        Some(Commands::Capture(args)) => run_capture(&cli.config, &args),
        Some(Commands::Config { output }) => generate_config_file(output).map(|_| ExitCode::SUCCESS),
        None => run_capture(&cli.config, &CaptureArgs::default()),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::from(EXIT_SETUP_FAILED)
        }
    }
}

/// Load the configuration file, falling back to defaults when it does not exist
fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        info!("📝 Loading configuration from {}", path.display());
        AppConfig::load_from_file(path)
    } else {
        info!("📝 No configuration at {}, using defaults", path.display());
        Ok(AppConfig::new())
    }
}

/// Run one capture session; errors returned here are setup failures
fn run_capture(config_path: &Path, args: &CaptureArgs) -> Result<ExitCode> {
    let mut config = load_config(config_path)?;
    args.apply(&mut config);
    config.validate()?;
    let total_bytes = config.capture.total_bytes().context("capture.word_count is too large")?;
    info!("📦 Transaction size: {} bytes ({} words)", total_bytes, config.capture.word_count);

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        handler_token.cancel();
    })
    .context("Failed to install Ctrl+C handler")?;

    let sink: Option<Box<dyn CaptureSink>> = if config.output.enabled {
        info!("💾 Saving {:?} output to {} ({:?})", config.output.format, config.output.path, config.output.layout);
        Some(Box::new(FileSink::from_config(&config.output)))
    } else {
        info!("📺 Persistence disabled");
        None
    };

    let report = if args.simulate {
        let peripheral = SimulatedPeripheral::new(SimulationConfig::new(config.capture.word_count));
        let report = run_session(peripheral.device(), &config, sink, cancel)?;
        info!("🧪 Simulated peripheral raised {} payloads ({} handles still open)",
              peripheral.payloads_emitted(), peripheral.open_handles());
        report
    } else {
        run_hardware(&config, sink, cancel)?
    };

    if let Some(path) = &args.report {
        write_report(&report, path)?;
    }

    if report.outcome.is_aborted() {
        Ok(ExitCode::from(EXIT_ABORTED))
    } else {
        println!("✅ Capture completed: {} transactions", report.transactions_completed);
        Ok(ExitCode::SUCCESS)
    }
}

#[cfg(feature = "hardware")]
fn run_hardware(config: &AppConfig, sink: Option<Box<dyn CaptureSink>>, cancel: CancellationToken) -> Result<SessionReport> {
    let device = device::open_linux_device(&config.device)?;
    run_session(device, config, sink, cancel)
}

#[cfg(not(feature = "hardware"))]
fn run_hardware(_config: &AppConfig, _sink: Option<Box<dyn CaptureSink>>, _cancel: CancellationToken) -> Result<SessionReport> {
    Err(device::DeviceError::Unsupported.into())
}

fn run_session<S: SpiLink, L: ReadyLine>(
    device: Device<S, L>,
    config: &AppConfig,
    sink: Option<Box<dyn CaptureSink>>,
    cancel: CancellationToken,
) -> Result<SessionReport> {
    let controller = SessionController::from_config(device, config, sink, cancel)
        .context("Failed to size capture buffers")?;
    Ok(controller.run())
}

fn write_report(report: &SessionReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize session report")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write session report: {}", path.display()))?;
    info!("📄 Session report written to {}", path.display());
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   spicapture --config {}", output_path.display());

    Ok(())
}
