//! MQTT-driven OTA log ingestion for LokaSync.
//!
//! Devices report update progress over MQTT. Each message is decoded on the
//! transport's network thread, handed to the async runtime, merged into the
//! matching update session in the store, and the resulting record is
//! re-published for dashboards.
//!
//! ```text
//! device -> broker -> MqttTransport -> decode -> Dispatcher
//!        -> UpsertEngine -> SessionStore
//!        -> Notifier -> broker -> dashboard
//! ```

pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod notifier;
pub mod pipeline;
pub mod service;
pub mod stats;
pub mod transport;
pub mod upsert;

pub use decoder::{decode, DecodedEvent, UpdateKind};
pub use dispatcher::{DispatchHandle, Dispatcher};
pub use error::{DecodeError, IngestError, Result, TransportError};
pub use notifier::Notifier;
pub use pipeline::{handle_inbound, Pipeline};
pub use service::{HealthSnapshot, LogIngestService};
pub use stats::{IngestStats, StatsSnapshot};
pub use transport::{
    ConnectionStatus, InboundMessage, MessageHandler, MessagePublisher, MqttTransport, Qos,
};
pub use upsert::UpsertEngine;
