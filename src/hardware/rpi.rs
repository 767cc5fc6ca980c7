use std::thread;
use std::time::{Duration, Instant};

use rppal::gpio::{Gpio, IoPin, Mode, OutputPin};
use tracing::debug;

use super::dht22::{self, FRAME_LEN};
use super::{
    ActuatorError, ActuatorProvider, Measurement, Providers, SensorError, SensorProvider,
};
use crate::config::HardwareConfig;

// Bit timings in microseconds, with slack for userspace scheduling jitter.
const START_LOW: Duration = Duration::from_millis(3);
const START_HIGH: Duration = Duration::from_micros(25);
const RESPONSE_TIMEOUT_US: u128 = 100;
const BIT_LOW_TIMEOUT_US: u128 = 70;
const BIT_HIGH_TIMEOUT_US: u128 = 90;
const ONE_THRESHOLD_US: u128 = 40;

pub fn open(config: &HardwareConfig) -> Result<Providers, String> {
    let gpio = Gpio::new().map_err(|e| format!("Failed to open GPIO: {e}"))?;

    let led = gpio
        .get(config.led_pin)
        .map_err(|e| format!("LED pin {}: {e}", config.led_pin))?
        .into_output_low();

    let dht = gpio
        .get(config.dht_pin)
        .map_err(|e| format!("DHT22 pin {}: {e}", config.dht_pin))?
        .into_io(Mode::Input);

    Ok(Providers {
        actuator: Box::new(GpioLed { pin: Some(led) }),
        sensor: Box::new(Dht22 { pin: Some(dht) }),
        simulated: false,
    })
}

pub struct GpioLed {
    pin: Option<OutputPin>,
}

impl ActuatorProvider for GpioLed {
    fn set(&mut self, on: bool) -> Result<(), ActuatorError> {
        let pin = self.pin.as_mut().ok_or(ActuatorError::Released)?;
        if on {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut pin) = self.pin.take() {
            pin.set_low();
            debug!("LED pin {} released", pin.pin());
        }
    }
}

pub struct Dht22 {
    pin: Option<IoPin>,
}

impl Dht22 {
    fn read_frame(pin: &mut IoPin) -> Result<[u8; FRAME_LEN], SensorError> {
        pin.set_mode(Mode::Output);
        pin.set_low();
        thread::sleep(START_LOW);
        pin.set_high();
        spin(START_HIGH);
        pin.set_mode(Mode::Input);

        // Sensor acknowledges with ~80us low then ~80us high.
        wait_while(pin, false, RESPONSE_TIMEOUT_US)?;
        wait_while(pin, true, RESPONSE_TIMEOUT_US)?;

        let mut frame = [0u8; FRAME_LEN];
        for bit in 0..FRAME_LEN * 8 {
            wait_while(pin, false, BIT_LOW_TIMEOUT_US)?;
            let high_us = wait_while(pin, true, BIT_HIGH_TIMEOUT_US)?;
            if high_us > ONE_THRESHOLD_US {
                frame[bit / 8] |= 1 << (7 - bit % 8);
            }
        }
        Ok(frame)
    }
}

impl SensorProvider for Dht22 {
    fn read(&mut self) -> Result<Measurement, SensorError> {
        let pin = self.pin.as_mut().ok_or(SensorError::Released)?;
        let frame = Self::read_frame(pin);
        // Leave the line released between reads.
        pin.set_mode(Mode::Input);
        dht22::decode(frame?)
    }

    fn release(&mut self) {
        if let Some(pin) = self.pin.take() {
            debug!("DHT22 pin {} released", pin.pin());
        }
    }
}

/// Busy-wait while the line stays at `high`, returning how long that took.
fn wait_while(pin: &IoPin, high: bool, timeout_us: u128) -> Result<u128, SensorError> {
    let start = Instant::now();
    while pin.is_high() == high {
        if start.elapsed().as_micros() > timeout_us {
            return Err(SensorError::Timeout);
        }
    }
    Ok(start.elapsed().as_micros())
}

fn spin(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}
