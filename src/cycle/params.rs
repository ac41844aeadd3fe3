//! Validated run and power parameters.
//!
//! Everything here is checked at acceptance time, before the controller
//! touches the instrument.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ValidationError;

/// Output voltage range of the source (V rms)
pub const VOLTAGE_RANGE: (f64, f64) = (0.0, 300.0);
/// Output frequency range of the source (Hz)
pub const FREQUENCY_RANGE: (f64, f64) = (15.0, 1000.0);
/// Longest accepted ON or OFF phase (one week, in seconds)
pub const MAX_PHASE_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// How many cycles a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleMode {
    /// Stop after a fixed number of cycles
    FixedCount,
    /// Repeat until stopped
    Continuous,
}

impl fmt::Display for CycleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleMode::FixedCount => write!(f, "fixed-count"),
            CycleMode::Continuous => write!(f, "continuous"),
        }
    }
}

/// Cycle count bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleCount {
    Fixed(u64),
    Unbounded,
}

/// Accepted timing for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleParameters {
    on_duration: Duration,
    off_duration: Duration,
    count: CycleCount,
}

fn positive_duration(field: &'static str, seconds: f64) -> Result<Duration, ValidationError> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(ValidationError::NonPositiveDuration {
            field,
            value: seconds,
        });
    }
    if seconds > MAX_PHASE_SECS {
        return Err(ValidationError::OutOfRange {
            field,
            value: seconds,
            min: 0.0,
            max: MAX_PHASE_SECS,
        });
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| ValidationError::NonPositiveDuration { field, value: seconds })
}

fn parse_number<T: std::str::FromStr>(field: &'static str, input: &str) -> Result<T, ValidationError> {
    input
        .trim()
        .parse()
        .map_err(|_| ValidationError::NonNumericInput {
            field,
            input: input.to_string(),
        })
}

impl CycleParameters {
    /// Validate parameters for `mode`. `count` is required for
    /// [`CycleMode::FixedCount`] and ignored for [`CycleMode::Continuous`].
    pub fn new(
        mode: CycleMode,
        on_secs: f64,
        off_secs: f64,
        count: Option<i64>,
    ) -> Result<Self, ValidationError> {
        match mode {
            CycleMode::FixedCount => {
                Self::fixed(on_secs, off_secs, count.ok_or(ValidationError::InvalidCount(0))?)
            }
            CycleMode::Continuous => Self::continuous(on_secs, off_secs),
        }
    }

    /// A fixed-count run of `count` cycles
    pub fn fixed(on_secs: f64, off_secs: f64, count: i64) -> Result<Self, ValidationError> {
        let on_duration = positive_duration("on duration", on_secs)?;
        let off_duration = positive_duration("off duration", off_secs)?;
        let count = u64::try_from(count)
            .ok()
            .filter(|&n| n >= 1)
            .ok_or(ValidationError::InvalidCount(count))?;
        Ok(Self {
            on_duration,
            off_duration,
            count: CycleCount::Fixed(count),
        })
    }

    /// An unbounded run
    pub fn continuous(on_secs: f64, off_secs: f64) -> Result<Self, ValidationError> {
        Ok(Self {
            on_duration: positive_duration("on duration", on_secs)?,
            off_duration: positive_duration("off duration", off_secs)?,
            count: CycleCount::Unbounded,
        })
    }

    /// Parse text fields as entered by the operator.
    pub fn from_text(
        mode: CycleMode,
        on: &str,
        off: &str,
        count: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let on_secs = parse_number("on duration", on)?;
        let off_secs = parse_number("off duration", off)?;
        let count = match (mode, count) {
            (CycleMode::FixedCount, Some(text)) => Some(parse_number("cycle count", text)?),
            _ => None,
        };
        Self::new(mode, on_secs, off_secs, count)
    }

    /// Run mode implied by the count
    pub fn mode(&self) -> CycleMode {
        match self.count {
            CycleCount::Fixed(_) => CycleMode::FixedCount,
            CycleCount::Unbounded => CycleMode::Continuous,
        }
    }

    /// Time the output stays on each cycle
    pub fn on_duration(&self) -> Duration {
        self.on_duration
    }

    /// Time the output stays off between cycles
    pub fn off_duration(&self) -> Duration {
        self.off_duration
    }

    /// Cycle bound
    pub fn count(&self) -> CycleCount {
        self.count
    }

    /// Number of cycles for fixed-count runs
    pub fn fixed_count(&self) -> Option<u64> {
        match self.count {
            CycleCount::Fixed(n) => Some(n),
            CycleCount::Unbounded => None,
        }
    }
}

impl fmt::Display for CycleParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.count {
            CycleCount::Fixed(n) => write!(f, "{n} cycles, ")?,
            CycleCount::Unbounded => write!(f, "continuous, ")?,
        }
        write!(
            f,
            "{}s on, {}s off",
            self.on_duration.as_secs_f64(),
            self.off_duration.as_secs_f64()
        )
    }
}

/// Output voltage and frequency, range-checked for the source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSettings {
    voltage_v: f64,
    frequency_hz: f64,
}

fn in_range(field: &'static str, value: f64, (min, max): (f64, f64)) -> Result<f64, ValidationError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

impl PowerSettings {
    /// Validate both values; nothing is applied unless both pass.
    pub fn new(voltage_v: f64, frequency_hz: f64) -> Result<Self, ValidationError> {
        Ok(Self {
            voltage_v: in_range("voltage", voltage_v, VOLTAGE_RANGE)?,
            frequency_hz: in_range("frequency", frequency_hz, FREQUENCY_RANGE)?,
        })
    }

    /// Parse text fields as entered by the operator.
    pub fn from_text(voltage: &str, frequency: &str) -> Result<Self, ValidationError> {
        Self::new(
            parse_number("voltage", voltage)?,
            parse_number("frequency", frequency)?,
        )
    }

    /// Voltage in V rms
    pub fn voltage_v(&self) -> f64 {
        self.voltage_v
    }

    /// Frequency in Hz
    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_parameters() {
        let params = CycleParameters::fixed(10.0, 5.0, 3).unwrap();
        assert_eq!(params.mode(), CycleMode::FixedCount);
        assert_eq!(params.on_duration(), Duration::from_secs(10));
        assert_eq!(params.fixed_count(), Some(3));
        assert_eq!(params.to_string(), "3 cycles, 10s on, 5s off");
    }

    #[test]
    fn test_rejects_non_positive_durations() {
        assert!(matches!(
            CycleParameters::fixed(0.0, 1.0, 1),
            Err(ValidationError::NonPositiveDuration { field: "on duration", .. })
        ));
        assert!(matches!(
            CycleParameters::continuous(1.0, -2.0),
            Err(ValidationError::NonPositiveDuration { field: "off duration", .. })
        ));
        assert!(CycleParameters::continuous(f64::NAN, 1.0).is_err());
        assert!(CycleParameters::continuous(f64::INFINITY, 1.0).is_err());
    }

    #[test]
    fn test_rejects_overlong_durations() {
        assert!(matches!(
            CycleParameters::fixed(1e19, 1.0, 1),
            Err(ValidationError::OutOfRange { field: "on duration", .. })
        ));
        assert!(matches!(
            CycleParameters::continuous(1.0, MAX_PHASE_SECS + 1.0),
            Err(ValidationError::OutOfRange { field: "off duration", .. })
        ));
        let longest = CycleParameters::continuous(MAX_PHASE_SECS, 1.0).unwrap();
        assert_eq!(longest.on_duration(), Duration::from_secs(604_800));
    }

    #[test]
    fn test_rejects_invalid_counts() {
        assert_eq!(
            CycleParameters::fixed(1.0, 1.0, 0),
            Err(ValidationError::InvalidCount(0))
        );
        assert_eq!(
            CycleParameters::fixed(1.0, 1.0, -4),
            Err(ValidationError::InvalidCount(-4))
        );
        assert_eq!(
            CycleParameters::new(CycleMode::FixedCount, 1.0, 1.0, None),
            Err(ValidationError::InvalidCount(0))
        );
    }

    #[test]
    fn test_continuous_ignores_count() {
        let params = CycleParameters::new(CycleMode::Continuous, 1.0, 1.0, Some(0)).unwrap();
        assert_eq!(params.count(), CycleCount::Unbounded);
    }

    #[test]
    fn test_from_text() {
        let params =
            CycleParameters::from_text(CycleMode::FixedCount, " 0.5", "0.25 ", Some("7")).unwrap();
        assert_eq!(params.on_duration(), Duration::from_millis(500));
        assert_eq!(params.fixed_count(), Some(7));

        let err = CycleParameters::from_text(CycleMode::FixedCount, "ten", "5", Some("1"))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::NonNumericInput {
                field: "on duration",
                input: "ten".to_string()
            }
        );
        assert!(matches!(
            CycleParameters::from_text(CycleMode::FixedCount, "1", "1", Some("2.5")),
            Err(ValidationError::NonNumericInput { field: "cycle count", .. })
        ));
    }

    #[test]
    fn test_power_settings_ranges() {
        let power = PowerSettings::new(115.0, 400.0).unwrap();
        assert_eq!(power.voltage_v(), 115.0);
        assert_eq!(power.frequency_hz(), 400.0);
        assert!(matches!(
            PowerSettings::new(115.0, 5.0),
            Err(ValidationError::OutOfRange { field: "frequency", .. })
        ));
        assert!(PowerSettings::new(-1.0, 400.0).is_err());
        assert!(matches!(
            PowerSettings::from_text("115", "abc"),
            Err(ValidationError::NonNumericInput { field: "frequency", .. })
        ));
    }
}
