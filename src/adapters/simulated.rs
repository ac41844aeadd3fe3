//! Simulated AC power source
//!
//! An in-process stand-in for the instrument that understands the same SCPI
//! subset as the real source. Used by the test suite and by `--simulate`.
//! It provides:
//! - Output relay, voltage and frequency state
//! - Controllable failure injection
//! - Command logging for test verification
//! - A silent mode that never answers queries (for timeout paths)
//! - Late replies that arrive after the caller gave up

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{Connector, LineTransport, OpenedTransport};
use crate::config::InstrumentConfig;
use crate::error::ConnectError;

/// Identity string reported to `*IDN?`
pub const SIMULATED_IDENTITY: &str = "Chroma ATE,61602,SIM-000001,1.00";

/// Address reported for the simulated port
pub const SIMULATED_ADDRESS: &str = "SIM::61602::INSTR";

#[derive(Debug, Default)]
struct SourceState {
    output: bool,
    voltage: f64,
    frequency: f64,
    /// Replies and the time they become readable
    pending: VecDeque<(String, Instant)>,
    reply_delay: Option<Duration>,
    commands: Vec<String>,
    fail_next: Option<io::ErrorKind>,
    silent: bool,
    output_stuck: Option<bool>,
    latency: Duration,
    open_sessions: usize,
}

/// Simulated power source
///
/// Cloning yields another handle onto the same instrument, so a test can
/// keep one handle for inspection while the link owns another.
///
/// # Example
///
/// ```
/// use acpower_cycler::adapters::SimulatedSource;
///
/// let source = SimulatedSource::new();
/// assert!(!source.output_enabled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SimulatedSource {
    state: Arc<Mutex<SourceState>>,
}

impl SimulatedSource {
    /// Create a source with output off, 0 V, 0 Hz
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Never answer queries; writes are still accepted
    pub fn silent(self) -> Self {
        self.lock().silent = true;
        self
    }

    /// Delay every write and read by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Hold back the next reply for `delay` after its query is written
    pub fn delay_next_reply(&self, delay: Duration) {
        self.lock().reply_delay = Some(delay);
    }

    /// Fail the next write with an I/O error of `kind`
    pub fn inject_next_failure(&self, kind: io::ErrorKind) {
        self.lock().fail_next = Some(kind);
    }

    /// Ignore output commands and always report `enabled`
    pub fn stick_output(&self, enabled: bool) {
        let mut state = self.lock();
        state.output_stuck = Some(enabled);
        state.output = enabled;
    }

    /// Whether the relay is currently closed
    pub fn output_enabled(&self) -> bool {
        self.lock().output
    }

    /// Last programmed voltage
    pub fn voltage(&self) -> f64 {
        self.lock().voltage
    }

    /// Last programmed frequency
    pub fn frequency(&self) -> f64 {
        self.lock().frequency
    }

    /// Every line received, in order
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Only the output set commands received, in order
    pub fn output_commands(&self) -> Vec<String> {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.to_ascii_uppercase().starts_with("OUTP") && !c.ends_with('?'))
            .cloned()
            .collect()
    }

    /// Clear the command log
    pub fn clear_log(&self) {
        self.lock().commands.clear();
    }

    /// Number of sessions opened and not yet closed
    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    fn handle(&self, line: &str) {
        let mut state = self.lock();
        state.commands.push(line.to_string());

        let mut parts = line.split_whitespace();
        let header = parts.next().unwrap_or_default().to_ascii_uppercase();
        let argument = parts.next();

        let reply = match header.as_str() {
            "*IDN?" => Some(SIMULATED_IDENTITY.to_string()),
            "*CLS" => None,
            "OUTP?" | "OUTPUT?" => Some(if state.output { "ON" } else { "OFF" }.to_string()),
            "OUTP" | "OUTPUT" => {
                let enable = argument.map(str::to_ascii_uppercase);
                let requested = match enable.as_deref() {
                    Some("ON") | Some("1") => Some(true),
                    Some("OFF") | Some("0") => Some(false),
                    _ => None,
                };
                match (requested, state.output_stuck) {
                    (Some(_), Some(stuck)) => state.output = stuck,
                    (Some(requested), None) => state.output = requested,
                    (None, _) => debug!("Simulated source ignoring '{}'", line),
                }
                None
            }
            "VOLT" | "VOLTAGE" => {
                if let Some(v) = argument.and_then(|a| a.parse().ok()) {
                    state.voltage = v;
                }
                None
            }
            "FREQ" | "FREQUENCY" => {
                if let Some(f) = argument.and_then(|a| a.parse().ok()) {
                    state.frequency = f;
                }
                None
            }
            _ => {
                debug!("Simulated source ignoring unknown command '{}'", line);
                None
            }
        };

        if let Some(reply) = reply {
            if !state.silent {
                let ready_at = Instant::now() + state.reply_delay.take().unwrap_or_default();
                state.pending.push_back((reply, ready_at));
            }
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl LineTransport for SimulatedSource {
    fn name(&self) -> &str {
        SIMULATED_ADDRESS
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.simulate_latency().await;
        if let Some(kind) = self.lock().fail_next.take() {
            return Err(io::Error::new(kind, "Injected failure"));
        }
        self.handle(line.trim());
        Ok(())
    }

    async fn read_line(&mut self, _timeout: Duration) -> io::Result<String> {
        self.simulate_latency().await;
        let ready_at = self.lock().pending.front().map(|(_, ready_at)| *ready_at);
        match ready_at {
            Some(ready_at) => {
                // Left queued until delivered, so an abandoned read leaves it behind
                tokio::time::sleep_until(ready_at).await;
                self.lock()
                    .pending
                    .pop_front()
                    .map(|(line, _)| line)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "reply discarded"))
            }
            // Nothing to say: behave like a port that never delivers a terminator
            None => std::future::pending().await,
        }
    }

    async fn discard_input(&mut self) -> io::Result<()> {
        let mut state = self.lock();
        let dropped = state.pending.len();
        state.pending.clear();
        if dropped > 0 {
            debug!("Simulated source discarded {} unread reply(ies)", dropped);
        }
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        let mut state = self.lock();
        state.open_sessions = state.open_sessions.saturating_sub(1);
        state.pending.clear();
        Ok(())
    }
}

/// Connector that hands out handles to one [`SimulatedSource`]
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    source: SimulatedSource,
    present: bool,
}

impl SimulatedConnector {
    /// Connector that always finds `source`
    pub fn new(source: SimulatedSource) -> Self {
        Self {
            source,
            present: true,
        }
    }

    /// Connector whose discovery finds nothing
    pub fn absent() -> Self {
        Self {
            source: SimulatedSource::new(),
            present: false,
        }
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn open(&self, config: &InstrumentConfig) -> Result<OpenedTransport, ConnectError> {
        if !self.present {
            return Err(ConnectError::NotFound(format!(
                "no {} port available",
                config.kind
            )));
        }
        self.source.lock().open_sessions += 1;
        Ok(OpenedTransport {
            transport: Box::new(self.source.clone()),
            address: config
                .port
                .clone()
                .unwrap_or_else(|| SIMULATED_ADDRESS.to_string()),
        })
    }
}
