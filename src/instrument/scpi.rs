//! SCPI command set of the AC power source.

use crate::error::QueryError;
use crate::instrument::OutputState;

/// Identity query
pub const IDENTIFY: &str = "*IDN?";
/// Clear status, sent once after connect
pub const CLEAR_STATUS: &str = "*CLS";
/// Enable the output relay
pub const OUTPUT_ON: &str = "OUTPut ON";
/// Disable the output relay
pub const OUTPUT_OFF: &str = "OUTPut OFF";
/// Query the output relay
pub const OUTPUT_QUERY: &str = "OUTPut?";

/// `OUTPut ON` or `OUTPut OFF`
pub fn output(enabled: bool) -> &'static str {
    if enabled {
        OUTPUT_ON
    } else {
        OUTPUT_OFF
    }
}

/// `VOLTage <v>`
pub fn voltage(volts: f64) -> String {
    format!("VOLTage {volts}")
}

/// `FREQuency <f>`
pub fn frequency(hertz: f64) -> String {
    format!("FREQuency {hertz}")
}

/// Interpret an `OUTPut?` response.
///
/// The reply is trimmed and compared case-insensitively; some firmware
/// revisions answer with `1`/`0` instead of `ON`/`OFF`.
pub fn parse_output_state(response: &str) -> Result<OutputState, QueryError> {
    let normalized = response.trim().to_ascii_uppercase();
    match normalized.as_str() {
        "ON" | "1" => Ok(OutputState::On),
        "OFF" | "0" => Ok(OutputState::Off),
        _ => Err(QueryError::Parse(response.trim().to_string())),
    }
}
