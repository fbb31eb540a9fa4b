//! Update session data model.
//!
//! An [`UpdateSession`] is the log record for one firmware-update attempt on
//! one node. It is addressed by its [`CompositeKey`], never by the surrogate
//! `id`, and evolves by merging [`FieldSet`]s into it as device telemetry
//! arrives.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::time::format_datetime;

/// Maximum length of any identity field.
const MAX_IDENTITY_LEN: usize = 255;

/// Minimum length of each identity field, in [`IDENTITY_FIELDS`] order.
const MIN_IDENTITY_LEN: [usize; 7] = [1, 12, 3, 3, 1, 3, 5];

/// Maximum length of `firmware_version`.
const MAX_VERSION_LEN: usize = 20;

/// The seven identity fields, in wire order.
pub const IDENTITY_FIELDS: [&str; 7] = [
    "session_id",
    "node_mac",
    "node_location",
    "node_type",
    "node_id",
    "node_codename",
    "firmware_version",
];

/// Progress fields of a session, each set by exactly one update kind.
pub const PROGRESS_FIELDS: [&str; 7] = [
    "download_started_at",
    "firmware_size_kb",
    "bytes_written",
    "download_duration_sec",
    "download_speed_kbps",
    "download_completed_at",
    "flash_completed_at",
];

/// Natural key of an update session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeKey {
    pub session_id: String,
    pub node_mac: String,
    pub node_location: String,
    pub node_type: String,
    pub node_id: String,
    pub node_codename: String,
    pub firmware_version: String,
}

impl CompositeKey {
    /// Field values in [`IDENTITY_FIELDS`] order.
    pub fn values(&self) -> [&str; 7] {
        [
            self.session_id.as_str(),
            self.node_mac.as_str(),
            self.node_location.as_str(),
            self.node_type.as_str(),
            self.node_id.as_str(),
            self.node_codename.as_str(),
            self.firmware_version.as_str(),
        ]
    }

    /// Unambiguous encoding of the full key, used as the store's primary key.
    ///
    /// Each value is length-prefixed so no choice of field contents can make
    /// two distinct keys collide.
    pub fn storage_key(&self) -> String {
        let values = self.values();
        let capacity = values.iter().map(|v| v.len() + 8).sum();
        let mut key = String::with_capacity(capacity);
        for value in values {
            key.push_str(&value.len().to_string());
            key.push(':');
            key.push_str(value);
            key.push('|');
        }
        key
    }

    /// Validate field contents beyond presence.
    pub fn validate(&self) -> Result<()> {
        for ((name, value), min) in IDENTITY_FIELDS
            .iter()
            .zip(self.values())
            .zip(MIN_IDENTITY_LEN)
        {
            let len = value.chars().count();
            if len < min {
                return Err(Error::Validation(format!(
                    "{} must be at least {} characters",
                    name, min
                )));
            }
            if len > MAX_IDENTITY_LEN {
                return Err(Error::Validation(format!(
                    "{} exceeds {} characters",
                    name, MAX_IDENTITY_LEN
                )));
            }
        }
        for (name, value) in [
            ("node_location", &self.node_location),
            ("node_type", &self.node_type),
            ("node_id", &self.node_id),
        ] {
            if !is_plain_token(value) {
                return Err(Error::Validation(format!(
                    "{} may only contain letters, digits, '_' and '-'",
                    name
                )));
            }
        }
        if self.firmware_version.len() > MAX_VERSION_LEN
            || !is_semantic_version(&self.firmware_version)
        {
            return Err(Error::Validation(format!(
                "firmware_version '{}' does not match MAJOR.MINOR.PATCH",
                self.firmware_version
            )));
        }
        Ok(())
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({}, v{})",
            self.node_codename, self.node_mac, self.session_id, self.firmware_version
        )
    }
}

/// ASCII letters, digits, `_` and `-` only.
fn is_plain_token(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Three dot-separated runs of ASCII digits.
fn is_semantic_version(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

/// Flash outcome of an update session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlashStatus {
    #[default]
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Failed,
}

impl FlashStatus {
    /// All statuses, in display order.
    pub const ALL: [FlashStatus; 3] = [
        FlashStatus::InProgress,
        FlashStatus::Success,
        FlashStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlashStatus::InProgress => "in progress",
            FlashStatus::Success => "success",
            FlashStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FlashStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlashStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "in progress" | "in_progress" => Ok(FlashStatus::InProgress),
            "success" => Ok(FlashStatus::Success),
            "failed" => Ok(FlashStatus::Failed),
            other => Err(Error::Validation(format!("unknown flash status '{}'", other))),
        }
    }
}

/// Partial set of session fields to overwrite.
///
/// Merging is set-only: a `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSet {
    pub download_started_at: Option<DateTime<Utc>>,
    pub firmware_size_kb: Option<f64>,
    pub bytes_written: Option<u64>,
    pub download_duration_sec: Option<f64>,
    pub download_speed_kbps: Option<f64>,
    pub download_completed_at: Option<DateTime<Utc>>,
    pub flash_completed_at: Option<DateTime<Utc>>,
    pub flash_status: Option<FlashStatus>,
}

impl FieldSet {
    pub fn is_empty(&self) -> bool {
        self.field_names().is_empty()
    }

    /// Names of the fields this set will write.
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.download_started_at.is_some() {
            names.push("download_started_at");
        }
        if self.firmware_size_kb.is_some() {
            names.push("firmware_size_kb");
        }
        if self.bytes_written.is_some() {
            names.push("bytes_written");
        }
        if self.download_duration_sec.is_some() {
            names.push("download_duration_sec");
        }
        if self.download_speed_kbps.is_some() {
            names.push("download_speed_kbps");
        }
        if self.download_completed_at.is_some() {
            names.push("download_completed_at");
        }
        if self.flash_completed_at.is_some() {
            names.push("flash_completed_at");
        }
        if self.flash_status.is_some() {
            names.push("flash_status");
        }
        names
    }
}

/// Log record for one firmware-update attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSession {
    /// Store-assigned surrogate id.
    pub id: String,
    /// First-seen time, immutable after insert.
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub key: CompositeKey,

    pub download_started_at: Option<DateTime<Utc>>,
    pub firmware_size_kb: Option<f64>,
    pub bytes_written: Option<u64>,
    pub download_duration_sec: Option<f64>,
    pub download_speed_kbps: Option<f64>,
    pub download_completed_at: Option<DateTime<Utc>>,
    pub flash_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub flash_status: FlashStatus,
}

impl UpdateSession {
    /// Materialize a first-seen session: identity, the given fields, nulls
    /// for everything else and `InProgress` unless `fields` says otherwise.
    pub fn new(key: CompositeKey, fields: &FieldSet, created_at: DateTime<Utc>) -> Self {
        let mut session = Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            created_at,
            key,
            download_started_at: None,
            firmware_size_kb: None,
            bytes_written: None,
            download_duration_sec: None,
            download_speed_kbps: None,
            download_completed_at: None,
            flash_completed_at: None,
            flash_status: FlashStatus::default(),
        };
        session.apply(fields);
        session
    }

    /// Overwrite every field present in `fields`; absent fields are kept.
    pub fn apply(&mut self, fields: &FieldSet) {
        if let Some(v) = fields.download_started_at {
            self.download_started_at = Some(v);
        }
        if let Some(v) = fields.firmware_size_kb {
            self.firmware_size_kb = Some(v);
        }
        if let Some(v) = fields.bytes_written {
            self.bytes_written = Some(v);
        }
        if let Some(v) = fields.download_duration_sec {
            self.download_duration_sec = Some(v);
        }
        if let Some(v) = fields.download_speed_kbps {
            self.download_speed_kbps = Some(v);
        }
        if let Some(v) = fields.download_completed_at {
            self.download_completed_at = Some(v);
        }
        if let Some(v) = fields.flash_completed_at {
            self.flash_completed_at = Some(v);
        }
        if let Some(v) = fields.flash_status {
            self.flash_status = v;
        }
    }

    /// Render the record in its outbound wire form.
    pub fn to_wire(&self, tz: &Tz) -> WireSession {
        let render = |dt: &Option<DateTime<Utc>>| dt.as_ref().map(|d| format_datetime(d, tz));
        WireSession {
            id: self.id.clone(),
            created_at: format_datetime(&self.created_at, tz),
            key: self.key.clone(),
            download_started_at: render(&self.download_started_at),
            firmware_size_kb: self.firmware_size_kb,
            bytes_written: self.bytes_written,
            download_duration_sec: self.download_duration_sec,
            download_speed_kbps: self.download_speed_kbps,
            download_completed_at: render(&self.download_completed_at),
            flash_completed_at: render(&self.flash_completed_at),
            flash_status: self.flash_status,
        }
    }
}

/// Outbound JSON shape of an [`UpdateSession`], timestamps pre-rendered in
/// the configured timezone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireSession {
    pub id: String,
    pub created_at: String,
    #[serde(flatten)]
    pub key: CompositeKey,
    pub download_started_at: Option<String>,
    pub firmware_size_kb: Option<f64>,
    pub bytes_written: Option<u64>,
    pub download_duration_sec: Option<f64>,
    pub download_speed_kbps: Option<f64>,
    pub download_completed_at: Option<String>,
    pub flash_completed_at: Option<String>,
    pub flash_status: FlashStatus,
}
