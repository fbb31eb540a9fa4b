//! Re-publishes updated sessions for live dashboards.

use std::sync::Arc;

use chrono_tz::Tz;
use tracing::{error, info};

use lokasync_core::{targets, UpdateSession};

use crate::error::Result;
use crate::transport::{MessagePublisher, Qos};

/// Publishes the wire form of a session on a fixed topic.
#[derive(Clone)]
pub struct Notifier {
    publisher: Arc<dyn MessagePublisher>,
    topic: String,
    qos: Qos,
    timezone: Tz,
}

impl Notifier {
    pub fn new(
        publisher: Arc<dyn MessagePublisher>,
        topic: impl Into<String>,
        qos: Qos,
        timezone: Tz,
    ) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            qos,
            timezone,
        }
    }

    /// Serialize and publish once. A failure is logged and returned; it
    /// never touches the stored record.
    pub fn notify(&self, session: &UpdateSession) -> Result<()> {
        let payload = serde_json::to_vec(&session.to_wire(&self.timezone))?;

        match self.publisher.publish(&self.topic, payload, self.qos) {
            Ok(()) => {
                info!(
                    target: targets::MQTT,
                    topic = %self.topic,
                    codename = %session.key.node_codename,
                    "Log data published"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    target: targets::MQTT,
                    topic = %self.topic,
                    error = %e,
                    "Failed to publish log data"
                );
                Err(e.into())
            }
        }
    }
}
