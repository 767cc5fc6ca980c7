pub mod client;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::device::{DeviceIdentity, HeartbeatAck, LedStateReport, Reading};
use crate::error::AgentError;

pub const REGISTER_DEVICE: &str = "register_device";
pub const DEVICE_REGISTERED: &str = "device_registered";
pub const REGISTRATION_ERROR: &str = "registration_error";
pub const LED_CONTROL: &str = "led_control";
pub const LED_STATE: &str = "led_state";
pub const TEMPERATURE_DATA: &str = "temperature_data";
pub const HEARTBEAT: &str = "heartbeat";
pub const HEARTBEAT_ACK: &str = "heartbeat_ack";

/// An event the device sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    RegisterDevice(DeviceIdentity),
    LedState(LedStateReport),
    TemperatureData(Reading),
    HeartbeatAck(HeartbeatAck),
}

impl Outbound {
    pub fn event_name(&self) -> &'static str {
        match self {
            Outbound::RegisterDevice(_) => REGISTER_DEVICE,
            Outbound::LedState(_) => LED_STATE,
            Outbound::TemperatureData(_) => TEMPERATURE_DATA,
            Outbound::HeartbeatAck(_) => HEARTBEAT_ACK,
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Outbound::RegisterDevice(identity) => serde_json::to_value(identity),
            Outbound::LedState(report) => serde_json::to_value(report),
            Outbound::TemperatureData(reading) => serde_json::to_value(reading),
            Outbound::HeartbeatAck(ack) => serde_json::to_value(ack),
        }
    }
}

/// An event delivered to the device, either from the server or from the
/// transport itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    DeviceRegistered(Value),
    RegistrationError(Value),
    LedControl(Value),
    Heartbeat,
    /// The transport lost the connection; carries a human readable reason.
    Disconnected(String),
}

impl Inbound {
    /// Map a server event onto the handler table. Unknown names yield `None`.
    pub fn from_event(name: &str, data: Value) -> Option<Self> {
        match name {
            DEVICE_REGISTERED => Some(Inbound::DeviceRegistered(data)),
            REGISTRATION_ERROR => Some(Inbound::RegistrationError(data)),
            LED_CONTROL => Some(Inbound::LedControl(data)),
            HEARTBEAT => Some(Inbound::Heartbeat),
            _ => None,
        }
    }
}

/// An open event connection. Dropping `outbound` closes it.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub events: mpsc::Receiver<Inbound>,
    /// Finishes once everything queued on `outbound` went out and the
    /// connection is closed.
    pub writer: JoinHandle<()>,
}

/// Opens event connections to a server address.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server_url: &str) -> Result<Connection, AgentError>;
}

/// The server side of an in-memory [`Connection`].
#[cfg(test)]
pub struct RemoteEnd {
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub events: mpsc::Sender<Inbound>,
}

#[cfg(test)]
pub fn loopback() -> (Connection, RemoteEnd) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(16);
    (
        Connection {
            outbound: outbound_tx,
            events: events_rx,
            writer: tokio::spawn(async {}),
        },
        RemoteEnd {
            outbound: outbound_rx,
            events: events_tx,
        },
    )
}
