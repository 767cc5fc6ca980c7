#[cfg_attr(not(feature = "rpi"), allow(dead_code))]
pub mod dht22;
#[cfg(feature = "rpi")]
pub mod rpi;
pub mod simulated;

use thiserror::Error;
use tracing::info;

use crate::config::HardwareConfig;

#[cfg_attr(not(feature = "rpi"), allow(dead_code))]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("sensor did not respond in time")]
    Timeout,
    #[error("checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    Checksum { expected: u8, actual: u8 },
    #[error("implausible reading: {temperature}°C, {humidity}%")]
    OutOfRange { temperature: f64, humidity: f64 },
    #[error("sensor already released")]
    Released,
}

#[cfg_attr(not(feature = "rpi"), allow(dead_code))]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActuatorError {
    #[error("actuator already released")]
    Released,
}

/// One raw temperature/humidity sample, before rounding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub temperature: f64,
    pub humidity: f64,
}

/// A digital output driving the status LED.
pub trait ActuatorProvider: Send {
    fn set(&mut self, on: bool) -> Result<(), ActuatorError>;

    /// Return the output to a safe state and free it. Must tolerate repeated calls.
    fn release(&mut self) {}
}

/// A temperature/humidity sensor. `read` performs a single attempt; retrying
/// is left to the caller.
pub trait SensorProvider: Send {
    fn read(&mut self) -> Result<Measurement, SensorError>;

    fn release(&mut self) {}
}

/// The capability objects an agent is built with.
pub struct Providers {
    pub actuator: Box<dyn ActuatorProvider>,
    pub sensor: Box<dyn SensorProvider>,
    pub simulated: bool,
}

impl Providers {
    pub fn simulated() -> Self {
        Self {
            actuator: Box::new(simulated::SimulatedLed::default()),
            sensor: Box::new(simulated::SimulatedSensor::new()),
            simulated: true,
        }
    }
}

/// Pick the hardware backend when it is compiled in and usable, otherwise
/// fall back to simulation. Decided once at startup.
pub fn detect(config: &HardwareConfig, allow_hardware: bool) -> Providers {
    if !allow_hardware {
        return Providers::simulated();
    }

    #[cfg(feature = "rpi")]
    {
        match rpi::open(config) {
            Ok(providers) => {
                info!(
                    "Using Raspberry Pi hardware (led pin {}, dht22 pin {})",
                    config.led_pin, config.dht_pin
                );
                return providers;
            }
            Err(e) => info!("GPIO unavailable ({}), running in simulation mode", e),
        }
    }

    #[cfg(not(feature = "rpi"))]
    {
        info!(
            "Built without hardware support (led pin {}, dht22 pin {} unused), running in simulation mode",
            config.led_pin, config.dht_pin
        );
    }

    Providers::simulated()
}
