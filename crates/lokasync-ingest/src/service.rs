//! OTA log ingest service.
//!
//! Wires transport, decoder, dispatcher, upsert engine and notifier, and
//! owns their startup and shutdown order.

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use lokasync_core::{targets, Config};
use lokasync_storage::SessionStore;

use crate::dispatcher::Dispatcher;
use crate::error::{IngestError, Result};
use crate::notifier::Notifier;
use crate::pipeline::{handle_inbound, Pipeline};
use crate::stats::{IngestStats, StatsSnapshot};
use crate::transport::{ConnectionStatus, MessageHandler, MessagePublisher, MqttTransport, Qos};
use crate::upsert::UpsertEngine;

/// How long `stop` waits for the network thread and for in-flight messages.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Point-in-time view of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub running: bool,
    pub connection: ConnectionStatus,
    pub subscribe_topic: String,
    pub publish_topic: String,
    pub counters: StatsSnapshot,
}

/// The MQTT log ingestion subsystem.
pub struct LogIngestService {
    config: Config,
    timezone: Tz,
    qos: Qos,
    transport: Arc<MqttTransport>,
    store: Arc<dyn SessionStore>,
    stats: Arc<IngestStats>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl LogIngestService {
    /// Validate `config` and build the service. Nothing connects until
    /// [`start`](Self::start).
    pub fn new(config: Config, store: Arc<dyn SessionStore>) -> Result<Self> {
        config.validate()?;
        let timezone = config.timezone()?;
        let qos = Qos::try_from(config.mqtt.qos)?;
        let transport = Arc::new(MqttTransport::new(config.mqtt.clone()));

        Ok(Self {
            config,
            timezone,
            qos,
            transport,
            store,
            stats: Arc::new(IngestStats::new()),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.lock().is_some()
    }

    /// Start dispatching and connect to the broker.
    ///
    /// Must be called from inside the runtime that will own store access.
    /// A broker that cannot be reached is not an error: the failure is
    /// logged and the network loop keeps retrying.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(IngestError::AlreadyRunning);
        }

        let mqtt = &self.config.mqtt;
        let publisher: Arc<dyn MessagePublisher> = self.transport.clone();
        let notifier = Notifier::new(publisher, mqtt.publish_topic.clone(), self.qos, self.timezone);
        let pipeline = Arc::new(Pipeline::new(
            UpsertEngine::new(Arc::clone(&self.store)),
            notifier,
            Arc::clone(&self.stats),
        ));

        let dispatcher = Dispatcher::spawn(&Handle::current(), pipeline);
        let dispatch = dispatcher.handle();
        let stats = Arc::clone(&self.stats);
        let handler: MessageHandler =
            Arc::new(move |message| handle_inbound(message, &dispatch, &stats));

        *self.dispatcher.lock() = Some(dispatcher);

        self.transport.subscribe(&mqtt.subscribe_topic, self.qos)?;

        if let Err(e) = self.transport.connect(handler) {
            error!(target: targets::MQTT, error = %e, "MQTT service could not start");
            return Ok(());
        }

        let timeout = Duration::from_secs(mqtt.connect_timeout_secs);
        if self.transport.wait_connected(timeout).await {
            info!(
                target: targets::MQTT,
                topic = %mqtt.subscribe_topic,
                qos = self.qos as u8,
                "MQTT service started"
            );
        } else {
            warn!(
                target: targets::MQTT,
                timeout_secs = mqtt.connect_timeout_secs,
                "Broker not reachable yet, retrying in background"
            );
        }
        Ok(())
    }

    /// Stop the network loop, disconnect, then drain the dispatcher.
    pub async fn stop(&self) -> Result<()> {
        let dispatcher = self
            .dispatcher
            .lock()
            .take()
            .ok_or(IngestError::NotRunning)?;

        if let Err(e) = self.transport.disconnect() {
            warn!(target: targets::MQTT, error = %e, "Disconnect request failed");
        }

        let transport = Arc::clone(&self.transport);
        let joined = tokio::time::timeout(
            SHUTDOWN_TIMEOUT,
            tokio::task::spawn_blocking(move || transport.join()),
        )
        .await;
        if joined.is_err() {
            warn!(target: targets::MQTT, "MQTT network thread did not exit in time");
        }

        dispatcher.shutdown(SHUTDOWN_TIMEOUT).await;

        info!(
            target: targets::SYSTEM,
            counters = ?self.stats.snapshot(),
            "MQTT service stopped"
        );
        Ok(())
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            running: self.is_running(),
            connection: self.transport.status(),
            subscribe_topic: self.config.mqtt.subscribe_topic.clone(),
            publish_topic: self.config.mqtt.publish_topic.clone(),
            counters: self.stats.snapshot(),
        }
    }
}
