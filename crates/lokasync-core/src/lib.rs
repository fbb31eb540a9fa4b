//! Core types for LokaSync.
//!
//! This crate holds the update session model, configuration and the time
//! helpers shared by the storage, ingest and CLI crates.

pub mod config;
pub mod error;
pub mod session;
pub mod time;

pub use config::{targets, Config, LoggingSettings, MqttSettings, StorageSettings};
pub use error::{Error, Result};
pub use session::{
    CompositeKey, FieldSet, FlashStatus, UpdateSession, WireSession, IDENTITY_FIELDS,
    PROGRESS_FIELDS,
};
