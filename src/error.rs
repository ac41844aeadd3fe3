//! Custom error types for the application.
//!
//! Each concern gets its own `thiserror` enum so callers can match on the
//! exact failure without string inspection:
//!
//! - **`ConnectError`**: opening the transport, the `*IDN?` handshake and the
//!   initial `*CLS`.
//! - **`CommandError`**: a set command (`OUTPut`, `VOLTage`, `FREQuency`)
//!   could not be delivered.
//! - **`QueryError`**: a query (`OUTPut?`) failed or returned text that could
//!   not be interpreted. Callers treat this as an unknown output state.
//! - **`ValidationError`**: user input rejected before any instrument traffic.
//! - **`StartError`** / **`ControlError`**: why the cycle controller refused an
//!   operation.
//! - **`CycleError`**: why an active run aborted.
//!
//! `AppError` consolidates all of them for the binary, with `#[from]`
//! conversions so `?` works across layers.

use std::time::Duration;
use thiserror::Error;

use crate::instrument::OutputState;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Failure to establish a session with the power source.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    #[error("No instrument found: {0}")]
    NotFound(String),

    #[error("I/O error while connecting: {0}")]
    Io(String),

    #[error("Instrument did not answer within {0:?}")]
    Timeout(Duration),
}

/// Failure to deliver a set command.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Instrument not connected")]
    NotConnected,

    #[error("I/O error while sending command: {0}")]
    Io(String),

    #[error("Command rejected by transport: {0}")]
    Rejected(String),

    #[error("Command not accepted within {0:?}")]
    Timeout(Duration),
}

/// Failure to read back instrument state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Instrument not connected")]
    NotConnected,

    #[error("I/O error while querying: {0}")]
    Io(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Unrecognised response: '{0}'")]
    Parse(String),
}

/// User input rejected at the boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} must be a positive number of seconds, got {value}")]
    NonPositiveDuration { field: &'static str, value: f64 },

    #[error("Cycle count must be at least 1, got {0}")]
    InvalidCount(i64),

    #[error("{field} is not a number: '{input}'")]
    NonNumericInput { field: &'static str, input: String },

    #[error("{field} {value} outside supported range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Why `CycleController::start` refused to launch a run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StartError {
    #[error("A test run is already active; stop it first")]
    AlreadyRunning,

    #[error("Instrument not connected")]
    NotConnected,

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Why a manual operation (toggle, parameter apply) was refused or failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    #[error("A test run is active; stop it before manual control")]
    RunActive,

    #[error("Instrument not connected")]
    NotConnected,

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Why an active run aborted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CycleError {
    #[error("Cycle {cycle}: {source}")]
    Command {
        cycle: u64,
        #[source]
        source: CommandError,
    },

    #[error("Cycle {cycle}: output reads {observed} but {expected} was commanded")]
    OutputMismatch {
        cycle: u64,
        expected: OutputState,
        observed: OutputState,
    },
}

/// Configuration loading or validation failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level error for the application.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
