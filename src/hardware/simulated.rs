use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{ActuatorError, ActuatorProvider, Measurement, SensorError, SensorProvider};

const BASE_TEMPERATURE: f64 = 22.0;
const TEMPERATURE_SPREAD: f64 = 3.0;
const BASE_HUMIDITY: f64 = 45.0;
const HUMIDITY_SPREAD: f64 = 10.0;

/// LED stand-in that only remembers its level.
#[derive(Debug, Default)]
pub struct SimulatedLed {
    on: bool,
}

impl SimulatedLed {
    #[cfg(test)]
    pub fn is_on(&self) -> bool {
        self.on
    }
}

impl ActuatorProvider for SimulatedLed {
    fn set(&mut self, on: bool) -> Result<(), ActuatorError> {
        if self.on != on {
            debug!("Simulated LED {}", if on { "on" } else { "off" });
        }
        self.on = on;
        Ok(())
    }

    fn release(&mut self) {
        self.on = false;
    }
}

/// Uniform noise around an indoor climate: 22°C ± 3, 45% ± 10.
pub struct SimulatedSensor {
    rng: StdRng,
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorProvider for SimulatedSensor {
    fn read(&mut self) -> Result<Measurement, SensorError> {
        Ok(Measurement {
            temperature: BASE_TEMPERATURE
                + self.rng.gen_range(-TEMPERATURE_SPREAD..=TEMPERATURE_SPREAD),
            humidity: BASE_HUMIDITY + self.rng.gen_range(-HUMIDITY_SPREAD..=HUMIDITY_SPREAD),
        })
    }
}
