mod config;
mod device;
mod error;
mod hardware;
mod socketio;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use device::DeviceIdentity;
use device::agent::{AgentSettings, DeviceAgent};
use socketio::Connector;
use socketio::client::SocketIoConnector;

/// Delay between connecting consecutive agents of a fleet.
const CONNECT_STAGGER: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting iot-device-agent (server={}, devices={}, interval={}s)",
        config.server.url, config.device.count, config.device.sample_interval_secs,
    );

    let connector: Arc<dyn Connector> = Arc::new(SocketIoConnector::new(config.connect_timeout()));
    let settings = AgentSettings::from_config(&config);

    let agents: Vec<DeviceAgent> = config
        .device_names()
        .into_iter()
        .map(|name| {
            let providers = hardware::detect(&config.hardware, config.hardware_enabled());
            DeviceAgent::new(
                DeviceIdentity::new(name),
                settings.clone(),
                connector.clone(),
                providers,
            )
        })
        .collect();

    let connected = tokio::select! {
        connected = connect_all(&agents, &config.server.url) => connected,
        _ = shutdown_signal() => {
            shutdown(&agents).await;
            return;
        }
    };

    if connected == 0 {
        error!("Failed to connect to server at {}", config.server.url);
        shutdown(&agents).await;
        std::process::exit(1);
    }
    info!("{}/{} devices connected", connected, agents.len());

    shutdown_signal().await;
    shutdown(&agents).await;
    info!("iot-device-agent stopped");
}

/// Connect every agent in turn, staggered. Returns how many succeeded.
async fn connect_all(agents: &[DeviceAgent], server_url: &str) -> usize {
    let mut connected = 0;
    for (i, agent) in agents.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(CONNECT_STAGGER).await;
        }
        match agent.connect(server_url).await {
            Ok(()) => {
                connected += 1;
                info!(
                    "[{}] Device connected successfully ({} mode)",
                    agent.identity().name(),
                    if agent.is_simulated() { "simulation" } else { "hardware" },
                );
            }
            Err(e) => warn!("[{}] Not connected: {}", agent.identity().name(), e),
        }
    }
    connected
}

async fn shutdown_signal() {
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = sigterm => info!("Received SIGTERM, shutting down"),
    }
}

/// Disconnect every agent and wait until each transport has closed.
async fn shutdown(agents: &[DeviceAgent]) {
    futures_util::future::join_all(agents.iter().map(DeviceAgent::disconnect)).await;
}
