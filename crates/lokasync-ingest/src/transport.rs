//! MQTT transport adapter using rumqttc.
//!
//! The network loop runs on its own OS thread and hands every inbound
//! publish to a synchronous handler on that thread. Publishing is
//! non-blocking and safe to call from the async runtime while the loop runs.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rumqttc::{Client, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet, Transport};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use lokasync_core::{targets, MqttSettings};

use crate::error::TransportError;

/// Capacity of the request channel between the client and the event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// MQTT QoS level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Qos {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for Qos {
    type Error = TransportError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(TransportError::Config(format!("unsupported QoS {}", other))),
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for Qos {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => Qos::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => Qos::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => Qos::ExactlyOnce,
        }
    }
}

/// A publish received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    /// Delivered from the broker's retained store rather than live traffic.
    pub retain: bool,
}

/// Connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Callback invoked on the network thread for each inbound publish.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Outbound side of the transport, as seen by the notifier.
pub trait MessagePublisher: Send + Sync {
    /// Queue a publish without blocking.
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), TransportError>;

    fn status(&self) -> ConnectionStatus;
}

/// Build client options from settings.
pub fn mqtt_options(settings: &MqttSettings) -> Result<MqttOptions, TransportError> {
    let (host, port) = settings
        .endpoint()
        .map_err(|e| TransportError::Config(e.to_string()))?;

    let mut opts = MqttOptions::new(settings.client_id.clone(), host, port);
    opts.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    opts.set_clean_session(true);

    if let Some((username, password)) = settings.credentials() {
        opts.set_credentials(username, password);
    }

    if settings.tls_enabled {
        let ca = std::fs::read(&settings.ca_cert_path).map_err(|e| {
            TransportError::Tls(format!(
                "failed to read CA certificate {}: {}",
                settings.ca_cert_path.display(),
                e
            ))
        })?;
        opts.set_transport(Transport::tls(ca, None, None));
    }

    Ok(opts)
}

/// Owned connection to the broker.
pub struct MqttTransport {
    settings: MqttSettings,
    status: Arc<RwLock<ConnectionStatus>>,
    client: Mutex<Option<Client>>,
    subscriptions: Arc<Mutex<Vec<(String, Qos)>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            client: Mutex::new(None),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.status.read() == ConnectionStatus::Connected
    }

    /// Start the network loop on a dedicated thread.
    ///
    /// Returns once the loop is running; the broker handshake completes in
    /// the background and is observable through [`status`](Self::status).
    /// A broker that cannot be reached is retried every
    /// `reconnect_interval_ms` until [`disconnect`](Self::disconnect).
    pub fn connect(&self, handler: MessageHandler) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let opts = match mqtt_options(&self.settings) {
            Ok(opts) => opts,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                *self.status.write() = ConnectionStatus::Error;
                return Err(e);
            }
        };

        let (client, connection) = Client::new(opts, REQUEST_CHANNEL_CAPACITY);
        *self.client.lock() = Some(client.clone());
        *self.status.write() = ConnectionStatus::Connecting;

        let event_loop = NetworkLoop {
            client,
            status: Arc::clone(&self.status),
            subscriptions: Arc::clone(&self.subscriptions),
            running: Arc::clone(&self.running),
            reconnect_interval: Duration::from_millis(self.settings.reconnect_interval_ms),
            handler,
        };

        let spawned = std::thread::Builder::new()
            .name("mqtt-network".to_string())
            .spawn(move || event_loop.run(connection));

        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                info!(
                    target: targets::MQTT,
                    broker = %self.settings.broker_url,
                    client_id = %self.settings.client_id,
                    tls = self.settings.tls_enabled,
                    "MQTT network loop started"
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.client.lock().take();
                *self.status.write() = ConnectionStatus::Error;
                Err(TransportError::Config(format!(
                    "failed to spawn network thread: {}",
                    e
                )))
            }
        }
    }

    /// Poll the connection state until connected or `timeout` elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_connected() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Subscribe now if connected and again after every reconnect.
    pub fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        {
            let mut subscriptions = self.subscriptions.lock();
            if !subscriptions.iter().any(|(t, _)| t == topic) {
                subscriptions.push((topic.to_string(), qos));
            }
        }

        if !self.is_connected() {
            debug!(target: targets::MQTT, topic, "Subscription deferred until connected");
            return Ok(());
        }

        match self.client.lock().as_ref() {
            Some(client) => client
                .try_subscribe(topic, qos.into())
                .map_err(|e| TransportError::Subscribe(e.to_string())),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Stop the network loop and ask the broker to close the session.
    ///
    /// Does not wait for the loop thread; see [`join`](Self::join).
    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.running.store(false, Ordering::SeqCst);
        let result = match self.client.lock().take() {
            Some(client) => client
                .try_disconnect()
                .map_err(|e| TransportError::Disconnect(e.to_string())),
            None => Ok(()),
        };
        *self.status.write() = ConnectionStatus::Disconnected;
        result
    }

    /// Wait for the loop thread to exit. Blocking.
    pub fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(target: targets::MQTT, "MQTT network thread panicked");
            }
        }
    }
}

impl MessagePublisher for MqttTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        match self.client.lock().as_ref() {
            Some(client) => client
                .try_publish(topic, qos.into(), false, payload)
                .map_err(|e| TransportError::Publish(e.to_string())),
            None => Err(TransportError::NotConnected),
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(client) = self.client.get_mut().take() {
            let _ = client.try_disconnect();
        }
    }
}

/// Connection state after a failed poll. A broker refusal (bad
/// credentials, rejected client id) is an error; anything else is retried
/// as a reconnect.
fn status_after_error(error: &ConnectionError) -> ConnectionStatus {
    match error {
        ConnectionError::ConnectionRefused(_) => ConnectionStatus::Error,
        _ => ConnectionStatus::Connecting,
    }
}

/// State owned by the network thread.
struct NetworkLoop {
    client: Client,
    status: Arc<RwLock<ConnectionStatus>>,
    subscriptions: Arc<Mutex<Vec<(String, Qos)>>>,
    running: Arc<AtomicBool>,
    reconnect_interval: Duration,
    handler: MessageHandler,
}

impl NetworkLoop {
    fn run(self, mut connection: Connection) {
        for event in connection.iter() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    *self.status.write() = ConnectionStatus::Connected;
                    info!(target: targets::MQTT, "Connected to MQTT broker");
                    self.resubscribe();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        qos: publish.qos.into(),
                        retain: publish.retain,
                    };
                    self.deliver(message);
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(target: targets::MQTT, pkid = ack.pkid, "Subscription acknowledged");
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    *self.status.write() = ConnectionStatus::Disconnected;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    let status = status_after_error(&e);
                    *self.status.write() = status;
                    let retry_in_ms = self.reconnect_interval.as_millis() as u64;
                    if status == ConnectionStatus::Error {
                        error!(
                            target: targets::MQTT,
                            error = %e,
                            retry_in_ms,
                            "Broker refused connection"
                        );
                    } else {
                        warn!(target: targets::MQTT, error = %e, retry_in_ms, "MQTT connection error");
                    }
                    std::thread::sleep(self.reconnect_interval);
                }
            }
        }

        *self.status.write() = ConnectionStatus::Disconnected;
        info!(target: targets::MQTT, "MQTT network loop stopped");
    }

    fn resubscribe(&self) {
        let subscriptions = self.subscriptions.lock().clone();
        for (topic, qos) in subscriptions {
            match self.client.try_subscribe(topic.as_str(), qos.into()) {
                Ok(()) => {
                    info!(target: targets::MQTT, topic = %topic, qos = qos as u8, "Subscribed")
                }
                Err(e) => {
                    error!(target: targets::MQTT, topic = %topic, error = %e, "Subscribe failed")
                }
            }
        }
    }

    fn deliver(&self, message: InboundMessage) {
        let topic = message.topic.clone();
        let handler = &self.handler;
        if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
            error!(target: targets::MQTT, topic = %topic, "Message handler panicked");
        }
    }
}
