use crate::errors::SyncError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Outbound side of the message broker.
#[async_trait]
pub trait MessageTransport: Send {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), SyncError>;

    /// Flushes and closes the connection on shutdown.
    async fn close(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// Bounds both the wait for the broker link and the hand-off of a single publish.
    pub connect_timeout: Duration,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            client_id: "minol_mqtt_bridge".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// rumqttc-backed transport.
///
/// A background task drives the event loop and keeps polling after errors,
/// which makes rumqttc reconnect on its own. `publish` waits for the link to
/// come back (bounded by the connect timeout) before giving up. A publish the
/// client cannot accept within the same timeout, because the broker stopped
/// acknowledging and the request queue is full, fails as a transport error.
pub struct MqttTransport {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    connect_timeout: Duration,
}

impl MqttTransport {
    pub fn connect(settings: &MqttSettings) -> Self {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        let (state_tx, state_rx) = watch::channel(false);

        info!(host = %settings.host, port = settings.port, "Connecting to MQTT broker");
        tokio::spawn(drive_event_loop(event_loop, state_tx));

        Self {
            client,
            connected: state_rx,
            connect_timeout: settings.connect_timeout,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn wait_connected(&mut self) -> Result<(), SyncError> {
        let outcome = tokio::time::timeout(self.connect_timeout, self.connected.wait_for(|up| *up))
            .await
            .map(|waited| waited.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SyncError::Transport("MQTT event loop stopped".to_string())),
            Err(_) => Err(SyncError::Transport(format!(
                "broker not reachable within {:?}",
                self.connect_timeout
            ))),
        }
    }
}

#[async_trait]
impl MessageTransport for MqttTransport {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), SyncError> {
        self.wait_connected().await?;
        let queued = tokio::time::timeout(
            self.connect_timeout,
            self.client.publish(topic, QoS::AtLeastOnce, retain, payload),
        )
        .await;
        match queued {
            Ok(result) => result?,
            Err(_) => {
                return Err(SyncError::Transport(format!(
                    "publish to {topic} not accepted within {:?}",
                    self.connect_timeout
                )))
            }
        }
        debug!(topic, "Published");
        Ok(())
    }

    /// Queues a DISCONNECT and waits (briefly) until the event loop has
    /// written it and stopped.
    async fn close(&mut self) {
        let queued = tokio::time::timeout(DISCONNECT_GRACE, self.client.disconnect()).await;
        match queued {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "MQTT disconnect failed");
                return;
            }
            Err(_) => {
                warn!("MQTT disconnect could not be queued");
                return;
            }
        }

        let connected = &mut self.connected;
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async move {
            connected.wait_for(|up| !*up).await.map(|_| ())
        })
        .await;
        if flushed.is_err() {
            warn!("MQTT disconnect not confirmed before shutdown");
        }
    }
}

async fn drive_event_loop(mut event_loop: EventLoop, state: watch::Sender<bool>) {
    loop {
        if state.is_closed() {
            break;
        }
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                state.send_replace(true);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                state.send_replace(false);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnected from MQTT broker");
                state.send_replace(false);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if state.send_replace(false) {
                    warn!(error = %e, "MQTT connection lost");
                } else {
                    debug!(error = %e, "MQTT connection attempt failed");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!("MQTT event loop exiting");
}
