//! Instrument link to the programmable AC power source.
//!
//! [`InstrumentLink`] is the only owner of the connection. Every command and
//! query goes through its async mutex, so the cycle engine and manual
//! controls can share one link without interleaving lines on the wire.
//!
//! ## Session lifecycle
//!
//! ```text
//! connect():  Connector::open -> *IDN? -> *CLS -> session stored
//! disconnect(): OUTPut OFF (best effort) -> close -> session dropped
//! ```
//!
//! A fatal transport error (broken pipe, EOF, device gone) drops the session
//! as well; there is no automatic reconnect.

pub mod scpi;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::{Connector, LineTransport, TransportKind};
use crate::config::InstrumentConfig;
use crate::error::{CommandError, ConnectError, QueryError};

/// Output relay state as last confirmed by a command or query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputState {
    On,
    Off,
    /// Before the first confirmation, or after a failed query
    #[default]
    Unknown,
}

impl From<bool> for OutputState {
    fn from(enabled: bool) -> Self {
        if enabled {
            OutputState::On
        } else {
            OutputState::Off
        }
    }
}

impl fmt::Display for OutputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputState::On => write!(f, "ON"),
            OutputState::Off => write!(f, "OFF"),
            OutputState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Describes an established session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Port or resource the instrument was found on
    pub address: String,
    /// Transport family
    pub kind: TransportKind,
    /// Trimmed `*IDN?` response
    pub identity: String,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.address, self.kind, self.identity)
    }
}

/// Transport failure before it is classified for the caller.
#[derive(Debug)]
enum LinkIoError {
    Io(io::Error),
    Timeout(Duration),
}

impl LinkIoError {
    fn is_fatal(&self) -> bool {
        match self {
            LinkIoError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            LinkIoError::Timeout(_) => false,
        }
    }
}

impl From<LinkIoError> for ConnectError {
    fn from(err: LinkIoError) -> Self {
        match err {
            LinkIoError::Io(e) => ConnectError::Io(e.to_string()),
            LinkIoError::Timeout(d) => ConnectError::Timeout(d),
        }
    }
}

impl From<LinkIoError> for CommandError {
    fn from(err: LinkIoError) -> Self {
        match err {
            LinkIoError::Io(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::InvalidInput | io::ErrorKind::PermissionDenied
                ) =>
            {
                CommandError::Rejected(e.to_string())
            }
            LinkIoError::Io(e) => CommandError::Io(e.to_string()),
            LinkIoError::Timeout(d) => CommandError::Timeout(d),
        }
    }
}

impl From<LinkIoError> for QueryError {
    fn from(err: LinkIoError) -> Self {
        match err {
            LinkIoError::Io(e) => QueryError::Io(e.to_string()),
            LinkIoError::Timeout(d) => QueryError::Timeout(d),
        }
    }
}

struct Session {
    transport: Box<dyn LineTransport>,
    info: ConnectionInfo,
    timeout: Duration,
}

impl Session {
    async fn send(&mut self, line: &str) -> Result<(), LinkIoError> {
        debug!("[{}] -> {}", self.info.address, line);
        match tokio::time::timeout(self.timeout, self.transport.write_line(line)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
                Err(LinkIoError::Timeout(self.timeout))
            }
            Ok(Err(e)) => Err(LinkIoError::Io(e)),
            Err(_) => Err(LinkIoError::Timeout(self.timeout)),
        }
    }

    async fn query(&mut self, line: &str, timeout: Duration) -> Result<String, LinkIoError> {
        // A reply that missed an earlier deadline must not answer this query
        if let Err(e) = self.transport.discard_input().await {
            return Err(LinkIoError::Io(e));
        }
        self.send(line).await?;
        let response = match tokio::time::timeout(timeout, self.transport.read_line(timeout)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(LinkIoError::Timeout(timeout))
            }
            Ok(Err(e)) => return Err(LinkIoError::Io(e)),
            Err(_) => return Err(LinkIoError::Timeout(timeout)),
        };
        debug!("[{}] <- {}", self.info.address, response);
        Ok(response)
    }

    async fn close_quietly(mut self) {
        if let Err(e) = self.transport.close().await {
            warn!("Error closing {}: {}", self.info.address, e);
        }
    }
}

#[derive(Default)]
struct LinkState {
    session: Option<Session>,
    last_known: OutputState,
}

/// Owner of the single connection to the power source.
pub struct InstrumentLink {
    connector: Arc<dyn Connector>,
    state: Mutex<LinkState>,
}

impl InstrumentLink {
    /// Create a disconnected link that will open transports through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            state: Mutex::new(LinkState::default()),
        }
    }

    /// Open the transport, identify the instrument and clear its status.
    ///
    /// An existing session is released first. On failure no connection is
    /// retained.
    pub async fn connect(&self, config: &InstrumentConfig) -> Result<ConnectionInfo, ConnectError> {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.session.take() {
            info!("Releasing previous session on {}", previous.info.address);
            Self::release(previous).await;
        }
        state.last_known = OutputState::Unknown;

        let opened = self.connector.open(config).await?;
        let mut session = Session {
            info: ConnectionInfo {
                address: opened.address,
                kind: config.kind,
                identity: String::new(),
            },
            transport: opened.transport,
            timeout: config.io_timeout(),
        };

        let identity = match session.query(scpi::IDENTIFY, config.identity_timeout()).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("No identity from {}: {:?}", session.info.address, e);
                session.close_quietly().await;
                return Err(e.into());
            }
        };
        if let Err(e) = session.send(scpi::CLEAR_STATUS).await {
            session.close_quietly().await;
            return Err(e.into());
        }

        session.info.identity = identity.trim().to_string();
        let info = session.info.clone();
        info!("Connected via {}", info);
        state.session = Some(session);
        Ok(info)
    }

    /// Best-effort output off, then release the transport. Never fails.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.last_known = OutputState::Unknown;
        match state.session.take() {
            Some(session) => {
                let address = session.info.address.clone();
                Self::release(session).await;
                info!("Disconnected from {}", address);
            }
            None => debug!("Disconnect requested with no open session"),
        }
    }

    async fn release(mut session: Session) {
        if let Err(e) = session.send(scpi::OUTPUT_OFF).await {
            warn!(
                "Output off during disconnect of {} failed: {:?}",
                session.info.address, e
            );
        }
        session.close_quietly().await;
    }

    /// Whether a session is open
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.session.is_some()
    }

    /// Details of the open session, if any
    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .map(|s| s.info.clone())
    }

    /// Output state as last confirmed by a command or query
    pub async fn last_known_state(&self) -> OutputState {
        self.state.lock().await.last_known
    }

    /// Send `OUTPut ON` / `OUTPut OFF`. No retry.
    pub async fn set_output(&self, enabled: bool) -> Result<(), CommandError> {
        let mut state = self.state.lock().await;
        let result = match state.session.as_mut() {
            Some(session) => session.send(scpi::output(enabled)).await,
            None => return Err(CommandError::NotConnected),
        };
        match result {
            Ok(()) => {
                state.last_known = OutputState::from(enabled);
                Ok(())
            }
            Err(e) => {
                Self::drop_if_fatal(&mut state, &e).await;
                Err(e.into())
            }
        }
    }

    /// Query `OUTPut?`. On any failure the last-known state becomes `Unknown`.
    pub async fn output_state(&self) -> Result<OutputState, QueryError> {
        let mut state = self.state.lock().await;
        let result = match state.session.as_mut() {
            Some(session) => {
                let timeout = session.timeout;
                session.query(scpi::OUTPUT_QUERY, timeout).await
            }
            None => {
                state.last_known = OutputState::Unknown;
                return Err(QueryError::NotConnected);
            }
        };
        let parsed = match result {
            Ok(response) => scpi::parse_output_state(&response),
            Err(e) => {
                Self::drop_if_fatal(&mut state, &e).await;
                Err(e.into())
            }
        };
        state.last_known = *parsed.as_ref().unwrap_or(&OutputState::Unknown);
        parsed
    }

    /// Program the output voltage (`VOLTage <v>`).
    pub async fn set_voltage(&self, volts: f64) -> Result<(), CommandError> {
        self.write_parameter(&scpi::voltage(volts)).await
    }

    /// Program the output frequency (`FREQuency <f>`).
    pub async fn set_frequency(&self, hertz: f64) -> Result<(), CommandError> {
        self.write_parameter(&scpi::frequency(hertz)).await
    }

    async fn write_parameter(&self, line: &str) -> Result<(), CommandError> {
        let mut state = self.state.lock().await;
        let result = match state.session.as_mut() {
            Some(session) => session.send(line).await,
            None => return Err(CommandError::NotConnected),
        };
        if let Err(e) = result {
            Self::drop_if_fatal(&mut state, &e).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn drop_if_fatal(state: &mut LinkState, err: &LinkIoError) {
        if !err.is_fatal() {
            return;
        }
        if let Some(session) = state.session.take() {
            warn!(
                "Connection to {} lost: {:?}; session closed",
                session.info.address, err
            );
            session.close_quietly().await;
        }
        state.last_known = OutputState::Unknown;
    }
}
