//! CLI entry point for acpower_cycler
//!
//! Starts the operator console against a real power source on a serial/USB
//! port, or against the in-process simulator with `--simulate`.
//!
//! # Usage
//!
//! ```bash
//! acpower_cycler --port /dev/ttyUSB0
//! acpower_cycler --kind usb
//! acpower_cycler --simulate --log-level debug
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use acpower_cycler::adapters::{Connector, SerialConnector, SimulatedConnector, SimulatedSource};
use acpower_cycler::config::Settings;
use acpower_cycler::console::Console;
use acpower_cycler::cycle::CycleController;
use acpower_cycler::instrument::InstrumentLink;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Serial,
    Usb,
}

impl From<KindArg> for acpower_cycler::adapters::TransportKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Serial => Self::Serial,
            KindArg::Usb => Self::Usb,
        }
    }
}

#[derive(Parser)]
#[command(name = "acpower_cycler")]
#[command(about = "On/off cycling test station for programmable AC power sources", long_about = None)]
struct Cli {
    /// Use the built-in simulated source instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// Serial or USB port of the instrument (first matching port if omitted)
    #[arg(long)]
    port: Option<String>,

    /// Transport kind; selects line termination and framing
    #[arg(long, value_enum)]
    kind: Option<KindArg>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(port) = &self.port {
            settings.instrument.port = Some(port.clone());
        }
        if let Some(kind) = self.kind {
            settings.instrument.kind = kind.into();
        }
        if let Some(level) = &self.log_level {
            settings.application.log_level = level.clone();
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load().context("Failed to load configuration")?;
    cli.apply(&mut settings);
    settings
        .validate()
        .context("Invalid command-line overrides")?;

    init_tracing(&settings.application.log_level);
    info!("Starting {}", settings.application.name);

    let connector: Arc<dyn Connector> = if cli.simulate {
        info!("Using simulated power source");
        Arc::new(SimulatedConnector::new(SimulatedSource::new()))
    } else {
        Arc::new(SerialConnector::new())
    };
    let link = Arc::new(InstrumentLink::new(connector));
    let (controller, events) = CycleController::new(link, settings.cycle.clone());
    let controller = Arc::new(controller);
    let shutdown_timeout = settings.cycle.shutdown_timeout();

    let mut console = Console::new(Arc::clone(&controller), settings, std::io::stdout());
    let stdin = BufReader::new(tokio::io::stdin());

    tokio::select! {
        result = console.run(stdin, events) => {
            result.context("Console failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; shutting down");
        }
    }

    controller.shutdown(shutdown_timeout).await;
    info!("Shutdown complete");
    Ok(())
}
