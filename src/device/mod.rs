pub mod agent;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DEVICE_TYPE: &str = "raspberry_pi_sensor";

/// Who this device is, as announced during registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceIdentity {
    #[serde(rename = "deviceName")]
    name: String,
    #[serde(rename = "deviceType")]
    kind: &'static str,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DEVICE_TYPE,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

/// One sampled climate reading, rounded to tenths.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity, percent.
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedStateReport {
    pub state: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatAck {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedCommand {
    On,
    Off,
}

impl LedCommand {
    /// "on"/"off" in any case; anything else is `None`.
    pub fn parse(command: &str) -> Option<Self> {
        match command.to_ascii_lowercase().as_str() {
            "on" => Some(LedCommand::On),
            "off" => Some(LedCommand::Off),
            _ => None,
        }
    }

    pub fn is_on(self) -> bool {
        matches!(self, LedCommand::On)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Round to one decimal place. 21.449 → 21.4
pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
