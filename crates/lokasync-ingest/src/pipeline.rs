//! Per-message processing: decode on the network thread, then upsert and
//! notify on the runtime.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use lokasync_core::{targets, UpdateSession};

use crate::decoder::{decode, DecodedEvent};
use crate::dispatcher::DispatchHandle;
use crate::error::Result;
use crate::notifier::Notifier;
use crate::stats::IngestStats;
use crate::transport::InboundMessage;
use crate::upsert::UpsertEngine;

/// Entry point for every inbound publish. Runs on the network thread, so it
/// only decodes and hands off; it never waits on the store.
pub fn handle_inbound(message: InboundMessage, dispatch: &DispatchHandle, stats: &IngestStats) {
    stats.record_received();

    if message.retain {
        stats.record_retained();
        info!(target: targets::MQTT, topic = %message.topic, "Skipping retained message");
        return;
    }

    debug!(
        target: targets::MQTT,
        topic = %message.topic,
        bytes = message.payload.len(),
        "Message received"
    );

    let event = match decode(&message.payload, Utc::now()) {
        Ok(event) => event,
        Err(e) if e.is_warning() => {
            stats.record_rejected();
            warn!(target: targets::MQTT, topic = %message.topic, reason = %e, "Skipping update");
            return;
        }
        Err(e) => {
            stats.record_rejected();
            error!(target: targets::MQTT, topic = %message.topic, reason = %e, "Rejected message");
            return;
        }
    };

    info!(
        target: targets::MQTT,
        kind = %event.kind,
        session_id = %event.key.session_id,
        fields = ?event.fields.field_names(),
        "Processing message"
    );

    match dispatch.submit(event) {
        Ok(()) => stats.record_dispatched(),
        Err(event) => {
            stats.record_failed();
            error!(
                target: targets::MQTT,
                session_id = %event.key.session_id,
                "Dispatcher is closed, message dropped"
            );
        }
    }
}

/// Upsert followed by notify, run once per dispatched event.
pub struct Pipeline {
    engine: UpsertEngine,
    notifier: Notifier,
    stats: Arc<IngestStats>,
}

impl Pipeline {
    pub fn new(engine: UpsertEngine, notifier: Notifier, stats: Arc<IngestStats>) -> Self {
        Self {
            engine,
            notifier,
            stats,
        }
    }

    /// Store the event and publish the result. Only a store failure is an
    /// error; the record stays written if publishing fails.
    pub async fn process(&self, event: DecodedEvent) -> Result<UpdateSession> {
        let outcome = match self.engine.upsert(&event.key, &event.fields).await {
            Ok(outcome) => {
                self.stats.record_upserted();
                outcome
            }
            Err(e) => {
                self.stats.record_failed();
                return Err(e);
            }
        };

        if self.notifier.notify(&outcome.session).is_ok() {
            self.stats.record_published();
        } else {
            self.stats.record_publish_failed();
        }

        Ok(outcome.session)
    }
}
