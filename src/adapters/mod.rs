//! Hardware adapter implementations
//!
//! Line-oriented transports that carry the SCPI text protocol between
//! [`InstrumentLink`](crate::instrument::InstrumentLink) and the power source.
//! A [`Connector`] discovers and opens a transport; the resulting
//! [`LineTransport`] is then owned by exactly one link session.

pub mod serial_adapter;
pub mod simulated;

pub use serial_adapter::SerialConnector;
pub use simulated::{SimulatedConnector, SimulatedSource};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;

use crate::config::InstrumentConfig;
use crate::error::ConnectError;

/// Physical transport family of the instrument port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// RS-232; baud/parity/framing must match the instrument's front panel
    #[default]
    Serial,
    /// USB virtual port; self-describing, serial framing ignored
    Usb,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Usb => write!(f, "usb"),
        }
    }
}

/// Serial parity setting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial stop bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

/// Line framing applied when a transport is opened.
///
/// A termination mismatch shows up as read timeouts, not parse errors, so
/// both ends must agree exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framing {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Appended to every outgoing line
    pub write_terminator: &'static str,
    /// Ends every incoming line
    pub read_terminator: u8,
}

impl Framing {
    /// Framing appropriate for `kind`, taking serial parameters from `config`.
    pub fn for_kind(kind: TransportKind, config: &InstrumentConfig) -> Self {
        match kind {
            TransportKind::Serial => Self {
                baud_rate: config.baud_rate,
                data_bits: config.data_bits,
                parity: config.parity,
                stop_bits: config.stop_bits,
                write_terminator: "\r",
                read_terminator: b'\r',
            },
            TransportKind::Usb => Self {
                baud_rate: config.baud_rate,
                data_bits: 8,
                parity: Parity::None,
                stop_bits: StopBits::One,
                write_terminator: "\n",
                read_terminator: b'\n',
            },
        }
    }
}

/// A bidirectional, line-delimited text channel to an instrument.
///
/// Implementations add and strip the line terminator themselves. Timeouts
/// are enforced by the caller around each call.
#[async_trait]
pub trait LineTransport: Send {
    /// Short description used in log lines (e.g. the port name)
    fn name(&self) -> &str;

    /// Send one line; the terminator is appended by the transport.
    async fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Read one line without its terminator, trimmed of whitespace.
    ///
    /// `timeout` is the deadline for the whole line. Blocking transports
    /// must give up by then so they release the port when the caller does.
    async fn read_line(&mut self, timeout: Duration) -> io::Result<String>;

    /// Drop any input already received but not yet read, such as the late
    /// answer to a query that timed out.
    async fn discard_input(&mut self) -> io::Result<()>;

    /// Release the underlying resource.
    async fn close(&mut self) -> io::Result<()>;
}

/// A freshly opened transport plus where it was found.
pub struct OpenedTransport {
    pub transport: Box<dyn LineTransport>,
    pub address: String,
}

impl fmt::Debug for OpenedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedTransport")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Discovers and opens transports.
///
/// Scoped to an `InstrumentLink` instance rather than held as process-wide
/// state; each link owns its connector.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Locate the instrument port and open it with the framing for `config.kind`.
    async fn open(&self, config: &InstrumentConfig) -> Result<OpenedTransport, ConnectError>;
}
