use thiserror::Error;

use crate::hardware::{ActuatorError, SensorError};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("registration rejected: {0}")]
    Registration(String),
    #[error("sensor read failed: {0}")]
    SensorRead(#[from] SensorError),
    #[error("sensor task failed: {0}")]
    SensorTask(#[from] tokio::task::JoinError),
    #[error("actuator error: {0}")]
    Actuator(#[from] ActuatorError),
    #[error("failed to send {event}: transport closed")]
    Send { event: &'static str },
    #[error("not connected")]
    NotConnected,
}
