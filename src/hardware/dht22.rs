//! DHT22 (AM2302) frame decoding.
//!
//! The sensor answers a start pulse with 40 bits: humidity (16 bits, tenths of
//! a percent), temperature (15 bits, tenths of a degree, MSB is the sign) and a
//! checksum byte equal to the low 8 bits of the sum of the first four bytes.

use super::{Measurement, SensorError};

pub const FRAME_LEN: usize = 5;

const MIN_TEMPERATURE: f64 = -40.0;
const MAX_TEMPERATURE: f64 = 80.0;

pub fn decode(frame: [u8; FRAME_LEN]) -> Result<Measurement, SensorError> {
    let expected = frame[..4]
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte));
    if expected != frame[4] {
        return Err(SensorError::Checksum {
            expected,
            actual: frame[4],
        });
    }

    let humidity = f64::from(u16::from_be_bytes([frame[0], frame[1]])) / 10.0;

    let mut temperature = f64::from(u16::from_be_bytes([frame[2] & 0x7F, frame[3]])) / 10.0;
    if frame[2] & 0x80 != 0 {
        temperature = -temperature;
    }

    if !(0.0..=100.0).contains(&humidity)
        || !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&temperature)
    {
        return Err(SensorError::OutOfRange {
            temperature,
            humidity,
        });
    }

    Ok(Measurement {
        temperature,
        humidity,
    })
}
