//! Typed positioning data returned by the HS6602 client.

use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

/// GPS antenna state as reported by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AntennaStatus {
    Good,
    Open,
    Short,
    Unknown,
}

impl AntennaStatus {
    pub fn from_register(raw: u16) -> Self {
        match raw {
            0 => Self::Good,
            1 => Self::Open,
            2 => Self::Short,
            _ => Self::Unknown,
        }
    }

    /// Open or short circuit. A fault overrides the positioning-status
    /// register: the solution is not trusted while the antenna is bad.
    pub fn is_fault(self) -> bool {
        matches!(self, Self::Open | Self::Short)
    }
}

impl fmt::Display for AntennaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Good => "good",
            Self::Open => "open",
            Self::Short => "short",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One positioning result.
///
/// `valid == false` means every position field is `None` and
/// `error_message` says why. A valid fix always carries latitude/longitude;
/// altitude, speed, heading and timestamp are individually optional because
/// a flaky register must not invalidate the whole solution. `0.0` is a
/// legitimate reading (stationary vehicle) and is distinct from `None`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PositionFix {
    pub valid: bool,
    /// Degrees, magnitude only; see `lat_direction`.
    pub latitude: Option<f64>,
    /// Degrees, magnitude only; see `lon_direction`.
    pub longitude: Option<f64>,
    pub lat_direction: Option<char>,
    pub lon_direction: Option<char>,
    /// Meters above sea level.
    pub altitude: Option<f64>,
    /// Ground speed in knots.
    pub speed_knots: Option<f64>,
    /// Ground heading in degrees.
    pub heading_degrees: Option<f64>,
    /// Local civil time, already offset by the module (no zone stored).
    pub timestamp: Option<NaiveDateTime>,
    pub antenna_status: Option<AntennaStatus>,
    pub gps_satellites: u16,
    pub bds_satellites: u16,
    pub error_message: Option<String>,
}

impl PositionFix {
    /// An invalid fix with a reason.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// An invalid fix caused by an antenna fault.
    pub fn antenna_fault(status: AntennaStatus) -> Self {
        Self {
            valid: false,
            antenna_status: Some(status),
            error_message: Some(format!("antenna fault: {status}")),
            ..Self::default()
        }
    }
}

/// Result of the module diagnostic run by [`crate::hs6602::Hs6602::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct GpsHealth {
    /// The version register answered, so the serial link and slave address
    /// are working.
    pub communication: bool,
    pub version: Option<String>,
    pub positioning: bool,
    pub antenna: Option<AntennaStatus>,
    pub problems: Vec<String>,
}
