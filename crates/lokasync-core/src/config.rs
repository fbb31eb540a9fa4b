//! Service configuration.
//!
//! Values come from an optional TOML file and are then overridden by
//! environment variables, so a deployment can keep using the same `.env`
//! keys the broker-side tooling already knows.

use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::time::parse_timezone;

/// Environment variable names.
pub mod env_vars {
    pub const MQTT_BROKER_URL: &str = "MQTT_BROKER_URL";
    pub const MQTT_BROKER_PORT: &str = "MQTT_BROKER_PORT";
    pub const MQTT_BROKER_VERSION: &str = "MQTT_BROKER_VERSION";
    pub const MQTT_BROKER_KEEPALIVE: &str = "MQTT_BROKER_KEEPALIVE";
    pub const MQTT_BROKER_USERNAME: &str = "MQTT_BROKER_USERNAME";
    pub const MQTT_BROKER_PASSWORD: &str = "MQTT_BROKER_PASSWORD";
    pub const MQTT_BROKER_TLS_ENABLED: &str = "MQTT_BROKER_TLS_ENABLED";
    pub const MQTT_BROKER_CA_CERT_NAME: &str = "MQTT_BROKER_CA_CERT_NAME";
    pub const MQTT_CLIENT_ID: &str = "MQTT_CLIENT_ID";
    pub const MQTT_SUBSCRIBE_TOPIC_LOG: &str = "MQTT_SUBSCRIBE_TOPIC_LOG";
    pub const MQTT_PUBLISH_TOPIC_LOG: &str = "MQTT_PUBLISH_TOPIC_LOG";
    pub const MQTT_DEFAULT_QOS: &str = "MQTT_DEFAULT_QOS";
    pub const TIMEZONE: &str = "TIMEZONE";
    pub const DATA_DIR: &str = "LOKASYNC_DATA_DIR";
    pub const LOG_DIR: &str = "LOKASYNC_LOG_DIR";
    pub const LOG_JSON: &str = "LOKASYNC_LOG_JSON";
}

/// Default values.
pub mod defaults {
    pub const BROKER_HOST: &str = "localhost";
    pub const BROKER_PORT: u16 = 1883;
    pub const PROTOCOL_VERSION: &str = "3.1.1";
    pub const KEEP_ALIVE_SECS: u64 = 60;
    pub const CA_CERT_PATH: &str = "emqxsl-ca-example.crt";
    pub const QOS: u8 = 1;
    pub const CONNECT_TIMEOUT_SECS: u64 = 5;
    pub const RECONNECT_INTERVAL_MS: u64 = 2000;
    pub const TIMEZONE: &str = "Asia/Jakarta";
    pub const DATA_DIR: &str = "./data";
    pub const LOG_FILTER: &str = "info";
}

/// Tracing target names, one per subsystem.
pub mod targets {
    pub const MQTT: &str = "lokasync::mqtt";
    pub const DB: &str = "lokasync::db";
    pub const SYSTEM: &str = "lokasync::system";
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    /// IANA timezone used when rendering timestamps.
    pub timezone: String,
}

/// Broker connection and topic settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    /// Broker host, optionally with a scheme (`mqtt://`, `mqtts://`, `tcp://`)
    /// and port.
    pub broker_url: String,
    pub port: u16,
    /// Only `3.1.1` is supported.
    pub protocol_version: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_enabled: bool,
    pub ca_cert_path: PathBuf,
    pub client_id: String,
    /// Topic devices publish OTA progress on.
    pub subscribe_topic: String,
    /// Topic updated session records are re-published on.
    pub publish_topic: String,
    pub qos: u8,
    pub connect_timeout_secs: u64,
    pub reconnect_interval_ms: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker_url: defaults::BROKER_HOST.to_string(),
            port: defaults::BROKER_PORT,
            protocol_version: defaults::PROTOCOL_VERSION.to_string(),
            keep_alive_secs: defaults::KEEP_ALIVE_SECS,
            username: None,
            password: None,
            tls_enabled: false,
            ca_cert_path: PathBuf::from(defaults::CA_CERT_PATH),
            client_id: random_client_id(),
            subscribe_topic: String::new(),
            publish_topic: String::new(),
            qos: defaults::QOS,
            connect_timeout_secs: defaults::CONNECT_TIMEOUT_SECS,
            reconnect_interval_ms: defaults::RECONNECT_INTERVAL_MS,
        }
    }
}

fn random_client_id() -> String {
    format!("lokasync_backend_{}", rand::thread_rng().gen_range(1000..10000))
}

impl MqttSettings {
    /// Host and port to dial, after stripping any scheme or path from
    /// `broker_url`. A port embedded in the URL wins over `port`.
    pub fn endpoint(&self) -> Result<(String, u16)> {
        let url = self.broker_url.trim();
        let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
        let authority = without_scheme
            .split('/')
            .next()
            .unwrap_or_default();

        if authority.is_empty() {
            return Err(Error::Config(format!("Invalid broker URL '{}'", self.broker_url)));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::Config(format!("Invalid port in broker URL '{}'", self.broker_url))
                })?;
                Ok((host.to_string(), port))
            }
            _ => Ok((authority.to_string(), self.port)),
        }
    }

    /// Whether the configured credentials are complete.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

/// Session store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(defaults::DATA_DIR),
        }
    }
}

impl StorageSettings {
    /// Path of the session log database.
    pub fn logs_db_path(&self) -> PathBuf {
        self.data_dir.join("logs.redb")
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
    /// Directory for daily-rolling log files; console only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: defaults::LOG_FILTER.to_string(),
            json: false,
            log_dir: None,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env_with(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        if config.timezone.is_empty() {
            config.timezone = defaults::TIMEZONE.to_string();
        }
        Ok(config)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mqtt = &mut self.mqtt;
        if let Some(v) = lookup(env_vars::MQTT_BROKER_URL) {
            mqtt.broker_url = v;
        }
        if let Some(v) = lookup(env_vars::MQTT_BROKER_PORT) {
            mqtt.port = parse_env(env_vars::MQTT_BROKER_PORT, &v)?;
        }
        if let Some(v) = lookup(env_vars::MQTT_BROKER_VERSION) {
            mqtt.protocol_version = v;
        }
        if let Some(v) = lookup(env_vars::MQTT_BROKER_KEEPALIVE) {
            mqtt.keep_alive_secs = parse_env(env_vars::MQTT_BROKER_KEEPALIVE, &v)?;
        }
        if let Some(v) = lookup(env_vars::MQTT_BROKER_USERNAME) {
            mqtt.username = Some(v);
        }
        if let Some(v) = lookup(env_vars::MQTT_BROKER_PASSWORD) {
            mqtt.password = Some(v);
        }
        if let Some(v) = lookup(env_vars::MQTT_BROKER_TLS_ENABLED) {
            mqtt.tls_enabled = parse_bool(&v);
        }
        if let Some(v) = lookup(env_vars::MQTT_BROKER_CA_CERT_NAME) {
            mqtt.ca_cert_path = PathBuf::from(v);
        }
        if let Some(v) = lookup(env_vars::MQTT_CLIENT_ID) {
            mqtt.client_id = v;
        }
        if let Some(v) = lookup(env_vars::MQTT_SUBSCRIBE_TOPIC_LOG) {
            mqtt.subscribe_topic = v;
        }
        if let Some(v) = lookup(env_vars::MQTT_PUBLISH_TOPIC_LOG) {
            mqtt.publish_topic = v;
        }
        if let Some(v) = lookup(env_vars::MQTT_DEFAULT_QOS) {
            mqtt.qos = parse_env(env_vars::MQTT_DEFAULT_QOS, &v)?;
        }
        if let Some(v) = lookup(env_vars::TIMEZONE) {
            self.timezone = v;
        }
        if let Some(v) = lookup(env_vars::DATA_DIR) {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(env_vars::LOG_DIR) {
            self.logging.log_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup(env_vars::LOG_JSON) {
            self.logging.json = parse_bool(&v);
        }
        if self.timezone.is_empty() {
            self.timezone = defaults::TIMEZONE.to_string();
        }
        Ok(())
    }

    /// Check the settings the ingest pipeline depends on.
    pub fn validate(&self) -> Result<()> {
        let mqtt = &self.mqtt;
        mqtt.endpoint()?;
        if !matches!(mqtt.protocol_version.as_str(), "3.1.1" | "4") {
            return Err(Error::Config(format!(
                "Unsupported MQTT protocol version '{}' (only 3.1.1 is supported)",
                mqtt.protocol_version
            )));
        }
        if mqtt.qos > 2 {
            return Err(Error::Config(format!("Invalid QoS level {}", mqtt.qos)));
        }
        if mqtt.keep_alive_secs < 5 {
            return Err(Error::Config(format!(
                "Keep-alive must be at least 5 seconds, got {}",
                mqtt.keep_alive_secs
            )));
        }
        if mqtt.client_id.is_empty() {
            return Err(Error::Config("MQTT client id must not be empty".to_string()));
        }
        if mqtt.subscribe_topic.trim().is_empty() {
            return Err(Error::Config(format!(
                "Subscribe topic is not set ({})",
                env_vars::MQTT_SUBSCRIBE_TOPIC_LOG
            )));
        }
        if mqtt.publish_topic.trim().is_empty() {
            return Err(Error::Config(format!(
                "Publish topic is not set ({})",
                env_vars::MQTT_PUBLISH_TOPIC_LOG
            )));
        }
        self.timezone()?;
        Ok(())
    }

    /// Parsed timezone.
    pub fn timezone(&self) -> Result<Tz> {
        parse_timezone(&self.timezone)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value for {}: '{}'", name, value)))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}
