//! Configuration System using Figment
//!
//! Settings are layered from:
//! 1. Built-in defaults (`Settings::default()`), matching a Chroma 61602 on
//!    RS-232 at 9600 8N1 and a 115 V / 400 Hz avionics bus
//! 2. Environment variables prefixed with `ACPOWER_` (nested keys use `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! ACPOWER_APPLICATION__LOG_LEVEL=debug
//! ACPOWER_INSTRUMENT__PORT=/dev/ttyUSB0
//! ACPOWER_INSTRUMENT__KIND=usb
//! ACPOWER_CYCLE__POLL_INTERVAL_MS=50
//! ```

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::adapters::{Framing, Parity, StopBits, TransportKind};
use crate::error::ConfigError;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "ACPOWER_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Transport and timeout settings for the power source
    pub instrument: InstrumentConfig,
    /// Cycle engine tuning and form defaults
    pub cycle: CycleConfig,
    /// Output voltage and frequency applied on request
    pub power: PowerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, shown in the console banner
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// How to reach the instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Transport kind; selects line termination and whether serial framing applies
    #[serde(default)]
    pub kind: TransportKind,
    /// Explicit port; when absent the first matching port is used
    #[serde(default)]
    pub port: Option<String>,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Serial data bits (5-8)
    pub data_bits: u8,
    /// Serial parity
    #[serde(default)]
    pub parity: Parity,
    /// Serial stop bits
    #[serde(default)]
    pub stop_bits: StopBits,
    /// Per-call I/O timeout in milliseconds
    pub timeout_ms: u64,
    /// Timeout for the `*IDN?` handshake; falls back to `timeout_ms`
    #[serde(default)]
    pub identity_timeout_ms: Option<u64>,
}

/// Cycle engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Cancellation polling granularity during phase waits
    pub poll_interval_ms: u64,
    /// Bounded wait for the active run to finish during shutdown
    pub shutdown_timeout_ms: u64,
    /// Read back `OUTPut?` after every transition and fault on divergence
    pub verify_output: bool,
    /// Console default for the ON phase
    pub default_on_secs: f64,
    /// Console default for the OFF phase
    pub default_off_secs: f64,
    /// Console default for fixed-count runs
    pub default_count: u32,
}

/// Power parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerConfig {
    /// Output voltage (V rms)
    pub voltage_v: f64,
    /// Output frequency (Hz)
    pub frequency_hz: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "On-Off Test Station".to_string(),
                log_level: "info".to_string(),
            },
            instrument: InstrumentConfig::default(),
            cycle: CycleConfig::default(),
            power: PowerConfig {
                voltage_v: 115.0,
                frequency_hz: 400.0,
            },
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Serial,
            port: None,
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout_ms: 5000,
            identity_timeout_ms: None,
        }
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            shutdown_timeout_ms: 2000,
            verify_output: true,
            default_on_secs: 10.0,
            default_off_secs: 5.0,
            default_count: 10,
        }
    }
}

impl InstrumentConfig {
    /// Per-call I/O timeout
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Timeout applied to the identity handshake
    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms.unwrap_or(self.timeout_ms))
    }

    /// Framing derived from the transport kind and the serial settings
    pub fn framing(&self) -> Framing {
        Framing::for_kind(self.kind, self)
    }
}

impl CycleConfig {
    /// Cancellation polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Shutdown join bound
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Settings {
    /// Load defaults overlaid with `ACPOWER_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    /// The layered provider chain used by [`Settings::load`].
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Extract and validate settings from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks that deserialization cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        if !matches!(
            self.application.log_level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return invalid(format!(
                "Invalid log level '{}'",
                self.application.log_level
            ));
        }
        if self.instrument.baud_rate == 0 {
            return invalid("instrument.baud_rate must be greater than 0".to_string());
        }
        if !(5..=8).contains(&self.instrument.data_bits) {
            return invalid(format!(
                "instrument.data_bits must be 5-8, got {}",
                self.instrument.data_bits
            ));
        }
        if self.instrument.timeout_ms == 0 || self.instrument.identity_timeout_ms == Some(0) {
            return invalid("instrument timeouts must be greater than 0".to_string());
        }
        if self.instrument.port.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return invalid("instrument.port cannot be empty".to_string());
        }
        if self.cycle.poll_interval_ms == 0 {
            return invalid("cycle.poll_interval_ms must be greater than 0".to_string());
        }
        crate::cycle::PowerSettings::new(self.power.voltage_v, self.power.frequency_hz)
            .map_err(|e| ConfigError::Validation(format!("power: {e}")))?;
        crate::cycle::CycleParameters::fixed(
            self.cycle.default_on_secs,
            self.cycle.default_off_secs,
            i64::from(self.cycle.default_count),
        )
        .map_err(|e| ConfigError::Validation(format!("cycle defaults: {e}")))?;
        Ok(())
    }
}
