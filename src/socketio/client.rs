use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rust_socketio::asynchronous::{Client, ClientBuilder};
use rust_socketio::{Event, Payload, TransportType};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    Connection, Connector, DEVICE_REGISTERED, HEARTBEAT, Inbound, LED_CONTROL, Outbound,
    REGISTRATION_ERROR,
};
use crate::error::AgentError;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Server events forwarded to the agent.
const FORWARDED_EVENTS: [&str; 4] = [
    DEVICE_REGISTERED,
    REGISTRATION_ERROR,
    LED_CONTROL,
    HEARTBEAT,
];

/// Socket.IO client over the websocket transport, default namespace.
pub struct SocketIoConnector {
    connect_timeout: Duration,
}

impl SocketIoConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for SocketIoConnector {
    async fn connect(&self, server_url: &str) -> Result<Connection, AgentError> {
        let (events_tx, events_rx) = mpsc::channel::<Inbound>(EVENT_CHANNEL_CAPACITY);
        // First of namespace ack or connect error wins.
        let (opened_tx, mut opened_rx) = mpsc::channel::<Result<(), String>>(1);

        let mut builder = ClientBuilder::new(server_url)
            .namespace("/")
            .transport_type(TransportType::Websocket);
        for name in FORWARDED_EVENTS {
            builder = builder.on(name, forward(name, events_tx.clone()));
        }

        let on_open = opened_tx.clone();
        let builder = builder
            .on(Event::Connect, move |_payload: Payload, _client: Client| {
                let _ = on_open.try_send(Ok(()));
                async {}.boxed()
            })
            .on(Event::Error, move |payload: Payload, _client: Client| {
                let reason = describe(&payload);
                warn!("Socket.IO error: {}", reason);
                let _ = opened_tx.try_send(Err(reason));
                async {}.boxed()
            })
            .on(Event::Close, move |_payload: Payload, _client: Client| {
                let events_tx = events_tx.clone();
                async move {
                    let _ = events_tx
                        .send(Inbound::Disconnected("connection closed".into()))
                        .await;
                }
                .boxed()
            });

        debug!("Opening Socket.IO session to {}", server_url);
        let establish = async {
            let client = builder
                .connect()
                .await
                .map_err(|e| AgentError::Connection(format!("Socket.IO connection failed: {e}")))?;
            match opened_rx.recv().await {
                Some(Ok(())) => Ok(client),
                Some(Err(reason)) => {
                    let _ = client.disconnect().await;
                    Err(AgentError::Connection(format!(
                        "server refused the connection: {reason}"
                    )))
                }
                None => Err(AgentError::Connection(
                    "connection closed during handshake".into(),
                )),
            }
        };
        let client = tokio::time::timeout(self.connect_timeout, establish)
            .await
            .map_err(|_| {
                AgentError::Connection(format!("timed out after {:?}", self.connect_timeout))
            })??;
        info!("Socket.IO session open to {}", server_url);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let writer = tokio::spawn(run_writer(client, outbound_rx));

        Ok(Connection {
            outbound: outbound_tx,
            events: events_rx,
            writer,
        })
    }
}

/// Callback that turns one named server event into an [`Inbound`].
fn forward(
    name: &'static str,
    events_tx: mpsc::Sender<Inbound>,
) -> impl FnMut(Payload, Client) -> BoxFuture<'static, ()> + Send + Sync + 'static {
    move |payload, _client| {
        let events_tx = events_tx.clone();
        async move {
            if let Some(event) = Inbound::from_event(name, first_argument(payload)) {
                if events_tx.send(event).await.is_err() {
                    debug!("Event receiver dropped, ignoring {}", name);
                }
            }
        }
        .boxed()
    }
}

/// The event data, `Null` when the server sent none.
fn first_argument(payload: Payload) -> Value {
    match payload {
        Payload::Text(values) => values.into_iter().next().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn describe(payload: &Payload) -> String {
    match payload {
        Payload::Text(values) => values
            .iter()
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        other => format!("{other:?}"),
    }
}

/// Emits outbound events in order. Once the outbound side is dropped, leaves
/// the namespace and closes the socket.
async fn run_writer(client: Client, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(event) = outbound_rx.recv().await {
        let name = event.event_name();
        let data = match event.payload() {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode {}: {}", name, e);
                continue;
            }
        };
        if let Err(e) = client.emit(name, Payload::Text(vec![data])).await {
            warn!("Failed to emit {}: {}", name, e);
        }
    }

    match client.disconnect().await {
        Ok(()) => debug!("Socket.IO session closed"),
        Err(e) => warn!("Failed to close Socket.IO session: {}", e),
    }
}
