//! Error types for the ingest pipeline.

use thiserror::Error;

/// Result type for ingest operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Broker connection, subscribe and publish failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid MQTT settings: {0}")]
    Config(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Disconnect failed: {0}")]
    Disconnect(String),
}

/// Reasons an inbound payload is dropped before reaching the store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("Malformed JSON payload: {0}")]
    MalformedJson(String),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Unknown message type: '{0}'")]
    UnknownMessage(String),

    #[error("Message '{message}' has no numeric value at data.{field}")]
    MissingData {
        message: &'static str,
        field: &'static str,
    },
}

impl DecodeError {
    /// Unrecognized or incomplete messages are expected noise and logged as
    /// warnings; everything else is an error.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            DecodeError::UnknownMessage(_) | DecodeError::MissingData { .. }
        )
    }
}

/// Pipeline-level errors.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Store error: {0}")]
    Storage(#[from] lokasync_storage::Error),

    #[error(transparent)]
    Core(#[from] lokasync_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Service is already running")]
    AlreadyRunning,

    #[error("Service is not running")]
    NotRunning,
}

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self {
        IngestError::Serialization(e.to_string())
    }
}
