//! Serial adapter for RS-232 and USB virtual-port instruments
//!
//! Wraps the `serialport` crate. Serial I/O is blocking, so every read and
//! write runs on Tokio's blocking pool and never on the caller's task.

use async_trait::async_trait;

use super::{Connector, OpenedTransport};
use crate::config::InstrumentConfig;
use crate::error::ConnectError;

#[cfg(feature = "instrument_serial")]
use super::{Framing, LineTransport, Parity, StopBits, TransportKind};
#[cfg(feature = "instrument_serial")]
use serialport::{SerialPort, SerialPortType};
#[cfg(feature = "instrument_serial")]
use std::{io, sync::Arc, time::Duration};
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::{debug, info};

/// Internal read timeout of the port; the overall line deadline is longer.
#[cfg(feature = "instrument_serial")]
const PORT_READ_SLICE: Duration = Duration::from_millis(100);

/// Opens serial ports, either the configured one or the first discovered.
#[derive(Debug, Default, Clone)]
pub struct SerialConnector;

impl SerialConnector {
    /// Create a connector for real serial hardware.
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, config: &InstrumentConfig) -> Result<OpenedTransport, ConnectError> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || -> Result<OpenedTransport, ConnectError> {
            let port_name = match &config.port {
                Some(port) => port.clone(),
                None => discover_port(config.kind)?,
            };
            let adapter = SerialAdapter::open(&port_name, config.framing())?;
            info!(
                "Opened {} port '{}' at {} baud",
                config.kind,
                port_name,
                config.baud_rate
            );
            Ok(OpenedTransport {
                transport: Box::new(adapter),
                address: port_name,
            })
        })
        .await
        .map_err(|e| ConnectError::Io(format!("Serial open task failed: {e}")))?
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, _config: &InstrumentConfig) -> Result<OpenedTransport, ConnectError> {
        Err(ConnectError::Io(
            "Serial support not enabled. Rebuild with --features instrument_serial".to_string(),
        ))
    }
}

/// Pick the first port of the requested family.
#[cfg(feature = "instrument_serial")]
fn discover_port(kind: TransportKind) -> Result<String, ConnectError> {
    let ports = serialport::available_ports()
        .map_err(|e| ConnectError::Io(format!("Failed to enumerate serial ports: {e}")))?;
    debug!("Discovered {} serial port(s)", ports.len());

    ports
        .into_iter()
        .find(|p| match kind {
            TransportKind::Usb => matches!(p.port_type, SerialPortType::UsbPort(_)),
            TransportKind::Serial => true,
        })
        .map(|p| p.port_name)
        .ok_or_else(|| ConnectError::NotFound(format!("no {kind} port available")))
}

/// Serial line transport
#[cfg(feature = "instrument_serial")]
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    framing: Framing,

    /// The actual serial port (behind Arc<Mutex> for blocking-pool access)
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

#[cfg(feature = "instrument_serial")]
impl SerialAdapter {
    /// Open `port_name` with the given framing.
    pub fn open(port_name: &str, framing: Framing) -> Result<Self, ConnectError> {
        let port = serialport::new(port_name, framing.baud_rate)
            .data_bits(match framing.data_bits {
                5 => serialport::DataBits::Five,
                6 => serialport::DataBits::Six,
                7 => serialport::DataBits::Seven,
                _ => serialport::DataBits::Eight,
            })
            .parity(match framing.parity {
                Parity::None => serialport::Parity::None,
                Parity::Odd => serialport::Parity::Odd,
                Parity::Even => serialport::Parity::Even,
            })
            .stop_bits(match framing.stop_bits {
                StopBits::One => serialport::StopBits::One,
                StopBits::Two => serialport::StopBits::Two,
            })
            .flow_control(serialport::FlowControl::None)
            .timeout(PORT_READ_SLICE)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => {
                    ConnectError::NotFound(format!("'{port_name}': {e}"))
                }
                _ => ConnectError::Io(format!("Failed to open serial port '{port_name}': {e}")),
            })?;

        Ok(Self {
            port_name: port_name.to_string(),
            framing,
            port: Some(Arc::new(Mutex::new(port))),
        })
    }

    fn port(&self) -> io::Result<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

/// Read bytes up to `delimiter`, giving up once `timeout` has elapsed.
///
/// The port's own read timeout is shorter than the line deadline, so
/// `TimedOut` from a single read just means "nothing yet".
#[cfg(feature = "instrument_serial")]
fn read_until<R: io::Read + ?Sized>(
    port: &mut R,
    delimiter: u8,
    timeout: Duration,
) -> io::Result<String> {
    let mut response = Vec::new();
    let mut buffer = [0u8; 1];
    let start = std::time::Instant::now();

    loop {
        if start.elapsed() > timeout {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("Serial read timeout after {timeout:?}"),
            ));
        }

        match port.read(&mut buffer) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Unexpected EOF from serial port",
                ));
            }
            Ok(_) => {
                if buffer[0] == delimiter {
                    break;
                }
                response.push(buffer[0]);
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(String::from_utf8_lossy(&response).trim().to_string())
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl LineTransport for SerialAdapter {
    fn name(&self) -> &str {
        &self.port_name
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let port = self.port()?;
        let framed = format!("{}{}", line, self.framing.write_terminator);

        tokio::task::spawn_blocking(move || {
            use std::io::Write;

            let mut port_guard = port.blocking_lock();
            port_guard.write_all(framed.as_bytes())?;
            port_guard.flush()
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("Serial I/O task panicked: {e}")))?
    }

    async fn read_line(&mut self, timeout: Duration) -> io::Result<String> {
        let port = self.port()?;
        let delimiter = self.framing.read_terminator;

        tokio::task::spawn_blocking(move || {
            let mut port_guard = port.blocking_lock();
            read_until(&mut **port_guard, delimiter, timeout)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("Serial I/O task panicked: {e}")))?
    }

    async fn discard_input(&mut self) -> io::Result<()> {
        let port = self.port()?;

        tokio::task::spawn_blocking(move || {
            let port_guard = port.blocking_lock();
            port_guard
                .clear(serialport::ClearBuffer::Input)
                .map_err(io::Error::from)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("Serial I/O task panicked: {e}")))?
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            debug!("Serial port '{}' closed", self.port_name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "instrument_serial")]
    #[test]
    fn test_open_missing_port_fails() {
        let framing = InstrumentConfig::default().framing();
        let result = SerialAdapter::open("/dev/definitely-not-a-power-source", framing);
        assert!(matches!(
            result,
            Err(ConnectError::NotFound(_)) | Err(ConnectError::Io(_))
        ));
    }

    /// Reader that never produces data, like an idle port.
    #[cfg(feature = "instrument_serial")]
    struct IdlePort;

    #[cfg(feature = "instrument_serial")]
    impl io::Read for IdlePort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(5));
            Err(io::Error::new(io::ErrorKind::TimedOut, "port read slice"))
        }
    }

    #[cfg(feature = "instrument_serial")]
    #[test]
    fn test_read_until_stops_at_delimiter() {
        let mut input = io::Cursor::new(b" ON \rOFF\r".to_vec());
        assert_eq!(
            read_until(&mut input, b'\r', Duration::from_secs(1)).unwrap(),
            "ON"
        );
        assert_eq!(
            read_until(&mut input, b'\r', Duration::from_secs(1)).unwrap(),
            "OFF"
        );
    }

    #[cfg(feature = "instrument_serial")]
    #[test]
    fn test_read_until_honours_caller_deadline() {
        let started = std::time::Instant::now();
        let err = read_until(&mut IdlePort, b'\r', Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connector_with_missing_port_reports_error() {
        let config = InstrumentConfig {
            port: Some("/dev/definitely-not-a-power-source".to_string()),
            ..InstrumentConfig::default()
        };
        let result = SerialConnector::new().open(&config).await;
        assert!(result.is_err());
    }
}
