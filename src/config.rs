use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub device: DeviceConfig,
    pub hardware: HardwareConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub url: String,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    /// Number of agents to run; more than one means a simulated fleet.
    pub count: usize,
    pub sample_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct HardwareConfig {
    pub simulate: bool,
    pub led_pin: u8,
    pub dht_pin: u8,
    pub sensor_retries: u32,
    pub sensor_retry_delay_secs: u64,
}

fn lookup_or_default<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn lookup_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Build the config from an arbitrary key lookup (the process environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let config = Self {
            server: ServerConfig {
                url: lookup_or_default(&lookup, "SERVER_URL", "http://localhost:3000".to_string()),
                connect_timeout_secs: lookup_or_default(&lookup, "CONNECT_TIMEOUT_SECS", 10),
            },
            device: DeviceConfig {
                name: lookup_or_default(&lookup, "DEVICE_NAME", "sensor-pi-001".to_string()),
                count: lookup_or_default(&lookup, "DEVICE_COUNT", 1),
                sample_interval_secs: lookup_or_default(&lookup, "SAMPLE_INTERVAL_SECS", 5),
            },
            hardware: HardwareConfig {
                simulate: lookup_flag(&lookup, "SIMULATE"),
                led_pin: lookup_or_default(&lookup, "LED_PIN", 18),
                dht_pin: lookup_or_default(&lookup, "DHT_PIN", 4),
                sensor_retries: lookup_or_default(&lookup, "SENSOR_RETRIES", 15),
                sensor_retry_delay_secs: lookup_or_default(&lookup, "SENSOR_RETRY_DELAY_SECS", 2),
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.device.name.trim().is_empty() {
            return Err("DEVICE_NAME must not be empty".into());
        }
        if self.device.count == 0 {
            return Err("DEVICE_COUNT must be > 0".into());
        }
        if self.device.sample_interval_secs == 0 {
            return Err("SAMPLE_INTERVAL_SECS must be > 0".into());
        }
        if self.server.connect_timeout_secs == 0 {
            return Err("CONNECT_TIMEOUT_SECS must be > 0".into());
        }
        if self.hardware.sensor_retries == 0 {
            return Err("SENSOR_RETRIES must be > 0".into());
        }
        let scheme_ok = ["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| self.server.url.starts_with(scheme));
        if !scheme_ok {
            return Err(format!(
                "SERVER_URL must start with http://, https://, ws:// or wss:// (got {})",
                self.server.url
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout_secs)
    }

    /// Whether real hardware may be used. A fleet of agents cannot share one
    /// set of pins, so only a single agent is ever hardware-backed.
    pub fn hardware_enabled(&self) -> bool {
        !self.hardware.simulate && self.device.count == 1
    }

    /// Names of the agents to start.
    /// count=1 → ["sensor-pi-001"]; count=3 → ["sensor-pi-001-001", ..., "sensor-pi-001-003"]
    pub fn device_names(&self) -> Vec<String> {
        if self.device.count == 1 {
            return vec![self.device.name.clone()];
        }
        (1..=self.device.count)
            .map(|i| format!("{}-{:03}", self.device.name, i))
            .collect()
    }
}
