use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    ConnectionState, DeviceIdentity, HeartbeatAck, LedCommand, LedStateReport, Reading,
    round_tenth,
};
use crate::config::Config;
use crate::error::AgentError;
use crate::hardware::{ActuatorProvider, Measurement, Providers, SensorProvider};
use crate::socketio::{Connector, Inbound, Outbound};

/// How long `disconnect` waits for the transport to flush and close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub sample_interval: Duration,
    /// Attempts per sensor read, at least one.
    pub sensor_retries: u32,
    pub sensor_retry_delay: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_interval: Duration::from_secs(config.device.sample_interval_secs),
            sensor_retries: config.hardware.sensor_retries,
            sensor_retry_delay: Duration::from_secs(config.hardware.sensor_retry_delay_secs),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            sensor_retries: 15,
            sensor_retry_delay: Duration::from_secs(2),
        }
    }
}

/// A device session: registers with the server, streams readings once
/// registered and obeys LED commands. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DeviceAgent {
    inner: Arc<Inner>,
}

struct Inner {
    identity: DeviceIdentity,
    settings: AgentSettings,
    connector: Arc<dyn Connector>,
    actuator: Mutex<Box<dyn ActuatorProvider>>,
    sensor: Arc<Mutex<Box<dyn SensorProvider>>>,
    simulated: bool,
    led_state: AtomicBool,
    running: AtomicBool,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceAgent {
    pub fn new(
        identity: DeviceIdentity,
        settings: AgentSettings,
        connector: Arc<dyn Connector>,
        providers: Providers,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                identity,
                settings,
                connector,
                actuator: Mutex::new(providers.actuator),
                sensor: Arc::new(Mutex::new(providers.sensor)),
                simulated: providers.simulated,
                led_state: AtomicBool::new(false),
                running: AtomicBool::new(false),
                state,
                outbound: Mutex::new(None),
                writer: Mutex::new(None),
                dispatcher: Mutex::new(None),
                sampler: Mutex::new(None),
            }),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    fn name(&self) -> &str {
        self.inner.identity.name()
    }

    pub fn is_simulated(&self) -> bool {
        self.inner.simulated
    }

    pub fn led_state(&self) -> bool {
        self.inner.led_state.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Open the event connection and announce this device. A failure leaves
    /// the agent disconnected and may be retried by the caller.
    pub async fn connect(&self, server_url: &str) -> Result<(), AgentError> {
        if self.connection_state() == ConnectionState::Connected {
            debug!("[{}] Already connected", self.name());
            return Ok(());
        }

        info!("[{}] Connecting to {}", self.name(), server_url);
        self.inner.state.send_replace(ConnectionState::Connecting);

        let connection = match self.inner.connector.connect(server_url).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("[{}] Connection failed: {}", self.name(), e);
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        *lock(&self.inner.outbound) = Some(connection.outbound);
        *lock(&self.inner.writer) = Some(connection.writer);
        self.inner.state.send_replace(ConnectionState::Connected);
        info!(
            "[{}] Connected to server: {}, registering as {}",
            self.name(),
            server_url,
            self.inner.identity.kind()
        );

        let agent = self.clone();
        let mut events = connection.events;
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                agent.dispatch(event);
            }
            agent.on_disconnected("event stream closed");
        });
        if let Some(previous) = lock(&self.inner.dispatcher).replace(dispatcher) {
            previous.abort();
        }

        self.emit(Outbound::RegisterDevice(self.inner.identity.clone()))
    }

    /// Route one inbound event to its handler.
    pub fn dispatch(&self, event: Inbound) {
        match event {
            Inbound::DeviceRegistered(ack) => self.on_registered(ack),
            Inbound::RegistrationError(data) => self.on_registration_error(data),
            Inbound::LedControl(data) => self.on_led_control(data),
            Inbound::Heartbeat => self.on_heartbeat(),
            Inbound::Disconnected(reason) => self.on_disconnected(&reason),
        }
    }

    /// Start the sampling loop unless one is already alive.
    pub fn on_registered(&self, ack: Value) {
        info!("[{}] Device registered: {}", self.name(), ack);
        self.inner.running.store(true, Ordering::SeqCst);

        let mut sampler = lock(&self.inner.sampler);
        if sampler.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("[{}] Sampling loop already running", self.name());
            return;
        }
        *sampler = Some(tokio::spawn(self.clone().sampling_loop()));
    }

    pub fn on_registration_error(&self, data: Value) {
        let reason = ["reason", "error", "message"]
            .iter()
            .find_map(|key| data.get(key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string());
        error!("[{}] {}", self.name(), AgentError::Registration(reason));
    }

    pub fn on_led_control(&self, data: Value) {
        info!("[{}] LED control received: {}", self.name(), data);
        let command = data.get("command").and_then(Value::as_str).unwrap_or_default();

        let Some(command) = LedCommand::parse(command) else {
            warn!("[{}] Unknown LED command: {:?}", self.name(), command);
            return;
        };

        if let Err(e) = self.set_led(command.is_on()) {
            error!("[{}] Failed to set LED: {}", self.name(), e);
        }
    }

    pub fn on_heartbeat(&self) {
        let ack = HeartbeatAck {
            timestamp: Utc::now(),
        };
        if let Err(e) = self.emit(Outbound::HeartbeatAck(ack)) {
            warn!("[{}] Failed to answer heartbeat: {}", self.name(), e);
        }
    }

    /// The transport went away. No reconnect is attempted; a later
    /// registration starts a fresh sampling loop.
    pub fn on_disconnected(&self, reason: &str) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.inner.sampler).take() {
            handle.abort();
        }
        lock(&self.inner.outbound).take();
        let previous = self.inner.state.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            warn!("[{}] Disconnected from server: {}", self.name(), reason);
        }
    }

    /// Drive the LED and mirror the new state to the server.
    pub fn set_led(&self, on: bool) -> Result<(), AgentError> {
        lock(&self.inner.actuator).set(on)?;
        self.inner.led_state.store(on, Ordering::SeqCst);
        info!("[{}] LED {}", self.name(), if on { "ON" } else { "OFF" });

        self.emit(Outbound::LedState(LedStateReport {
            state: on,
            timestamp: Utc::now(),
        }))
    }

    /// Take one reading. `None` means the sensor kept failing and this tick
    /// should be skipped.
    pub async fn sample_reading(&self) -> Option<Reading> {
        match self.read_sensor().await {
            Ok(measurement) => Some(Reading {
                temperature: round_tenth(measurement.temperature),
                humidity: round_tenth(measurement.humidity),
                timestamp: Utc::now(),
            }),
            Err(e) => {
                warn!("[{}] {}", self.name(), e);
                None
            }
        }
    }

    async fn read_sensor(&self) -> Result<Measurement, AgentError> {
        let attempts = self.inner.settings.sensor_retries.max(1);
        let mut attempt = 1;
        loop {
            // Hardware reads sleep and busy-wait on bit timings.
            let sensor = Arc::clone(&self.inner.sensor);
            let result = tokio::task::spawn_blocking(move || lock(&sensor).read()).await?;
            match result {
                Ok(measurement) => return Ok(measurement),
                Err(e) if attempt >= attempts => return Err(AgentError::SensorRead(e)),
                Err(e) => debug!(
                    "[{}] Sensor read attempt {}/{} failed: {}",
                    self.name(),
                    attempt,
                    attempts,
                    e
                ),
            }
            attempt += 1;
            tokio::time::sleep(self.inner.settings.sensor_retry_delay).await;
        }
    }

    /// Sample and transmit every interval while registered and connected.
    pub async fn sampling_loop(self) {
        info!("[{}] Starting data transmission", self.name());

        while self.is_running() && self.connection_state() == ConnectionState::Connected {
            match self.sample_reading().await {
                Some(reading) => {
                    let (temperature, humidity) = (reading.temperature, reading.humidity);
                    match self.emit(Outbound::TemperatureData(reading)) {
                        Ok(()) => info!("[{}] Sent: {}°C, {}%", self.name(), temperature, humidity),
                        Err(e) => error!("[{}] Error in data loop: {}", self.name(), e),
                    }
                }
                None => warn!("[{}] Failed to read sensor data, skipping", self.name()),
            }

            tokio::time::sleep(self.inner.settings.sample_interval).await;
        }

        debug!("[{}] Sampling loop stopped", self.name());
    }

    /// Stop sampling, close the connection and release hardware. Returns once
    /// the transport has left the session or `CLOSE_TIMEOUT` passed.
    /// Idempotent.
    pub async fn disconnect(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        if let Some(handle) = lock(&self.inner.sampler).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.inner.dispatcher).take() {
            handle.abort();
        }
        // Dropping the sender makes the transport leave and close the socket.
        lock(&self.inner.outbound).take();
        let writer = lock(&self.inner.writer).take();
        if let Some(writer) = writer {
            if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                warn!("[{}] Transport did not close within {:?}", self.name(), CLOSE_TIMEOUT);
            }
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);

        if self.led_state() {
            debug!("[{}] Switching LED off", self.name());
        }
        lock(&self.inner.actuator).release();
        lock(&self.inner.sensor).release();
        self.inner.led_state.store(false, Ordering::SeqCst);

        info!("[{}] Device disconnected and cleaned up", self.name());
    }

    fn emit(&self, event: Outbound) -> Result<(), AgentError> {
        let outbound = lock(&self.inner.outbound);
        let sender = outbound.as_ref().ok_or(AgentError::NotConnected)?;
        let name = event.event_name();
        sender
            .send(event)
            .map_err(|_| AgentError::Send { event: name })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::hardware::simulated::SimulatedSensor;
    use crate::hardware::{ActuatorError, SensorError};
    use crate::socketio::{self, Connection, RemoteEnd};

    /// Hands out the queued connections in order, then refuses.
    struct LoopbackConnector {
        connections: Mutex<Vec<Connection>>,
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn connect(&self, _server_url: &str) -> Result<Connection, AgentError> {
            let mut connections = lock(&self.connections);
            if connections.is_empty() {
                return Err(AgentError::Connection("server unreachable".into()));
            }
            Ok(connections.remove(0))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingLed {
        writes: Arc<Mutex<Vec<bool>>>,
        released: Arc<AtomicBool>,
    }

    impl ActuatorProvider for RecordingLed {
        fn set(&mut self, on: bool) -> Result<(), ActuatorError> {
            lock(&self.writes).push(on);
            Ok(())
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Fails `failures` times, then reads 21.449°C / 50.051%.
    struct FlakySensor {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    impl SensorProvider for FlakySensor {
        fn read(&mut self) -> Result<Measurement, SensorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(SensorError::Timeout);
            }
            Ok(Measurement {
                temperature: 21.449,
                humidity: 50.051,
            })
        }
    }

    fn seeded_providers() -> Providers {
        Providers {
            sensor: Box::new(SimulatedSensor::with_seed(1)),
            ..Providers::simulated()
        }
    }

    fn agent_with(providers: Providers, connection: Option<Connection>) -> DeviceAgent {
        agent_with_settings(providers, connection, AgentSettings::default())
    }

    fn agent_with_settings(
        providers: Providers,
        connection: Option<Connection>,
        settings: AgentSettings,
    ) -> DeviceAgent {
        DeviceAgent::new(
            DeviceIdentity::new("sensor-test-001"),
            settings,
            Arc::new(LoopbackConnector {
                connections: Mutex::new(connection.into_iter().collect()),
            }),
            providers,
        )
    }

    async fn connected(agent_for: impl FnOnce(Connection) -> DeviceAgent) -> (DeviceAgent, RemoteEnd) {
        let (connection, mut remote) = socketio::loopback();
        let agent = agent_for(connection);
        agent.connect("http://localhost:3000").await.unwrap();
        assert!(matches!(
            remote.outbound.recv().await,
            Some(Outbound::RegisterDevice(_))
        ));
        (agent, remote)
    }

    fn drain(remote: &mut RemoteEnd) -> Vec<Outbound> {
        let mut events = Vec::new();
        while let Ok(event) = remote.outbound.try_recv() {
            events.push(event);
        }
        events
    }

    fn readings(events: &[Outbound]) -> Vec<&Reading> {
        events
            .iter()
            .filter_map(|event| match event {
                Outbound::TemperatureData(reading) => Some(reading),
                _ => None,
            })
            .collect()
    }

    fn is_tenth(value: f64) -> bool {
        ((value * 10.0).round() - value * 10.0).abs() < 1e-9
    }

    #[tokio::test]
    async fn connect_registers_with_configured_identity() {
        let (connection, mut remote) = socketio::loopback();
        let agent = agent_with(seeded_providers(), Some(connection));

        agent.connect("http://localhost:3000").await.unwrap();

        assert_eq!(agent.connection_state(), ConnectionState::Connected);
        let Some(Outbound::RegisterDevice(identity)) = remote.outbound.recv().await else {
            panic!("expected register_device first");
        };
        assert_eq!(identity.name(), "sensor-test-001");
        assert_eq!(identity.kind(), "raspberry_pi_sensor");
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn failed_connect_stays_disconnected() {
        let agent = agent_with(seeded_providers(), None);

        let result = agent.connect("http://localhost:3000").await;

        assert!(matches!(result, Err(AgentError::Connection(_))));
        assert_eq!(agent.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(agent.set_led(true), Err(AgentError::NotConnected)));
    }

    #[tokio::test]
    async fn set_led_mirrors_every_change() {
        let led = RecordingLed::default();
        let providers = Providers {
            actuator: Box::new(led.clone()),
            ..seeded_providers()
        };
        let (agent, mut remote) = connected(|c| agent_with(providers, Some(c))).await;

        agent.set_led(true).unwrap();
        agent.set_led(false).unwrap();

        assert!(!agent.led_state());
        assert_eq!(*lock(&led.writes), vec![true, false]);
        let states: Vec<bool> = drain(&mut remote)
            .into_iter()
            .map(|event| match event {
                Outbound::LedState(report) => report.state,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(states, vec![true, false]);
    }

    #[tokio::test]
    async fn led_control_ignores_case_and_unknown_commands() {
        let (agent, mut remote) = connected(|c| agent_with(seeded_providers(), Some(c))).await;

        agent.on_led_control(json!({"command": "ON"}));
        assert!(agent.led_state());
        let events = drain(&mut remote);
        assert!(matches!(events.as_slice(), [Outbound::LedState(r)] if r.state));

        agent.on_led_control(json!({"command": "bogus"}));
        agent.on_led_control(json!({"command": " on"}));
        agent.on_led_control(json!({"command": "on\n"}));
        agent.on_led_control(json!({"command": 1}));
        agent.on_led_control(json!({}));
        assert!(agent.led_state());
        assert!(drain(&mut remote).is_empty());

        agent.on_led_control(json!({"command": "off"}));
        assert!(!agent.led_state());
        let events = drain(&mut remote);
        assert!(matches!(events.as_slice(), [Outbound::LedState(r)] if !r.state));
    }

    #[tokio::test]
    async fn led_control_before_registration_is_applied() {
        let (agent, mut remote) = connected(|c| agent_with(seeded_providers(), Some(c))).await;

        remote
            .events
            .send(Inbound::LedControl(json!({"command": "on"})))
            .await
            .unwrap();

        let Some(Outbound::LedState(report)) = remote.outbound.recv().await else {
            panic!("expected led_state");
        };
        assert!(report.state);
        assert!(agent.led_state());
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged_once() {
        let (_agent, mut remote) = connected(|c| agent_with(seeded_providers(), Some(c))).await;

        let received_at = Utc::now();
        remote.events.send(Inbound::Heartbeat).await.unwrap();

        let Some(Outbound::HeartbeatAck(ack)) = remote.outbound.recv().await else {
            panic!("expected heartbeat_ack");
        };
        assert!(ack.timestamp >= received_at);
        tokio::task::yield_now().await;
        assert!(drain(&mut remote).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_registration_runs_a_single_sampling_loop() {
        let (agent, mut remote) = connected(|c| agent_with(seeded_providers(), Some(c))).await;

        remote
            .events
            .send(Inbound::DeviceRegistered(json!({"deviceName": "sensor-test-001"})))
            .await
            .unwrap();
        remote
            .events
            .send(Inbound::DeviceRegistered(json!({"deviceName": "sensor-test-001"})))
            .await
            .unwrap();

        // Ticks at 0s, 5s and 10s.
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert!(agent.is_running());
        let events = drain(&mut remote);
        let readings = readings(&events);
        assert_eq!(readings.len(), 3);
        for reading in readings {
            assert!((19.0..=25.0).contains(&reading.temperature));
            assert!((35.0..=55.0).contains(&reading.humidity));
            assert!(is_tenth(reading.temperature) && is_tenth(reading.humidity));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registration_error_does_not_start_sampling() {
        let (agent, mut remote) = connected(|c| agent_with(seeded_providers(), Some(c))).await;

        remote
            .events
            .send(Inbound::RegistrationError(json!({"error": "Device registration failed"})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert!(!agent.is_running());
        assert_eq!(agent.connection_state(), ConnectionState::Connected);
        assert!(drain(&mut remote).is_empty());
    }

    #[tokio::test]
    async fn simulated_readings_are_bounded_and_rounded() {
        let agent = agent_with(seeded_providers(), None);
        assert!(agent.is_simulated());

        for _ in 0..500 {
            let reading = agent.sample_reading().await.expect("simulation never fails");
            assert!((19.0..=25.0).contains(&reading.temperature), "{}", reading.temperature);
            assert!((35.0..=55.0).contains(&reading.humidity), "{}", reading.humidity);
            assert!(is_tenth(reading.temperature), "{}", reading.temperature);
            assert!(is_tenth(reading.humidity), "{}", reading.humidity);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_reads_are_retried_then_rounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let providers = Providers {
            sensor: Box::new(FlakySensor {
                failures: 2,
                calls: calls.clone(),
            }),
            ..Providers::simulated()
        };
        let settings = AgentSettings {
            sensor_retries: 3,
            sensor_retry_delay: Duration::from_secs(2),
            ..AgentSettings::default()
        };
        let agent = agent_with_settings(providers, None, settings);

        let reading = agent.sample_reading().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(reading.temperature, 21.4);
        assert_eq!(reading.humidity, 50.1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_sensor_failure_skips_ticks_without_stopping() {
        let calls = Arc::new(AtomicU32::new(0));
        let providers = Providers {
            sensor: Box::new(FlakySensor {
                failures: u32::MAX,
                calls: calls.clone(),
            }),
            ..Providers::simulated()
        };
        let settings = AgentSettings {
            sensor_retries: 3,
            sensor_retry_delay: Duration::from_secs(1),
            ..AgentSettings::default()
        };
        let (agent, mut remote) =
            connected(|c| agent_with_settings(providers, Some(c), settings)).await;

        agent.on_registered(json!({}));
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(agent.sample_reading().await.is_none());
        assert!(agent.is_running());
        assert!(readings(&drain(&mut remote)).is_empty());
        // Three ticks of three attempts each, plus the direct read above.
        assert!(calls.load(Ordering::SeqCst) >= 9);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_drop_stops_sampling() {
        let (agent, mut remote) = connected(|c| agent_with(seeded_providers(), Some(c))).await;

        agent.on_registered(json!({}));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(readings(&drain(&mut remote)).len(), 1);

        remote
            .events
            .send(Inbound::Disconnected("connection closed".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert_eq!(agent.connection_state(), ConnectionState::Disconnected);
        assert!(!agent.is_running());
        assert!(readings(&drain(&mut remote)).is_empty());
        assert!(remote.outbound.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_transport_drop_restarts_sampling() {
        let (first, mut first_remote) = socketio::loopback();
        let (second, mut second_remote) = socketio::loopback();
        let agent = DeviceAgent::new(
            DeviceIdentity::new("sensor-test-001"),
            AgentSettings::default(),
            Arc::new(LoopbackConnector {
                connections: Mutex::new(vec![first, second]),
            }),
            seeded_providers(),
        );
        let registered = || Inbound::DeviceRegistered(json!({"deviceName": "sensor-test-001"}));

        agent.connect("http://localhost:3000").await.unwrap();
        first_remote.events.send(registered()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(readings(&drain(&mut first_remote)).len(), 1);

        first_remote
            .events
            .send(Inbound::Disconnected("connection closed".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!agent.is_running());

        agent.connect("http://localhost:3000").await.unwrap();
        assert!(matches!(
            second_remote.outbound.recv().await,
            Some(Outbound::RegisterDevice(_))
        ));
        second_remote.events.send(registered()).await.unwrap();
        // Fresh loop ticks right away, then at 5s and 10s.
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert!(agent.is_running());
        assert_eq!(agent.connection_state(), ConnectionState::Connected);
        assert_eq!(readings(&drain(&mut second_remote)).len(), 3);
        assert!(readings(&drain(&mut first_remote)).is_empty());
    }

    struct PanickingSensor;

    impl SensorProvider for PanickingSensor {
        fn read(&mut self) -> Result<Measurement, SensorError> {
            panic!("sensor driver crashed");
        }
    }

    #[tokio::test]
    async fn sensor_panic_skips_the_reading() {
        let providers = Providers {
            sensor: Box::new(PanickingSensor),
            ..Providers::simulated()
        };
        let agent = agent_with(providers, None);

        assert!(agent.sample_reading().await.is_none());
        // The sensor mutex is poisoned but still usable for release.
        agent.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_releases_hardware() {
        let led = RecordingLed::default();
        let providers = Providers {
            actuator: Box::new(led.clone()),
            ..seeded_providers()
        };
        let (agent, mut remote) = connected(|c| agent_with(providers, Some(c))).await;
        agent.set_led(true).unwrap();
        agent.on_registered(json!({}));

        agent.disconnect().await;
        assert_eq!(agent.connection_state(), ConnectionState::Disconnected);
        assert!(!agent.is_running());
        assert!(!agent.led_state());
        assert!(led.released.load(Ordering::SeqCst));

        agent.disconnect().await;
        assert_eq!(agent.connection_state(), ConnectionState::Disconnected);

        drain(&mut remote);
        assert!(remote.outbound.recv().await.is_none());
    }
}
