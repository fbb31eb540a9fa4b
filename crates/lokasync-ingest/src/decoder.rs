//! Decoding of device OTA progress messages.
//!
//! Devices publish a JSON object carrying the seven identity fields, a
//! free-text `message` naming the progress step and, for some steps, a
//! numeric value under `data`. Decoding is pure: the caller supplies the
//! server time used for the timestamp-stamping steps.

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use lokasync_core::{CompositeKey, FieldSet, FlashStatus};

use crate::error::DecodeError;

/// A recognized progress step, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    OtaUpdateStarted,
    FirmwareSizeOk,
    FirmwareBytesWritten,
    DownloadTime,
    DownloadSpeed,
    DownloadComplete,
    OtaUpdateComplete,
}

impl UpdateKind {
    pub const ALL: [UpdateKind; 7] = [
        UpdateKind::OtaUpdateStarted,
        UpdateKind::FirmwareSizeOk,
        UpdateKind::FirmwareBytesWritten,
        UpdateKind::DownloadTime,
        UpdateKind::DownloadSpeed,
        UpdateKind::DownloadComplete,
        UpdateKind::OtaUpdateComplete,
    ];

    /// Normalized message text.
    pub fn message(&self) -> &'static str {
        match self {
            UpdateKind::OtaUpdateStarted => "ota update started",
            UpdateKind::FirmwareSizeOk => "firmware size ok",
            UpdateKind::FirmwareBytesWritten => "firmware bytes written",
            UpdateKind::DownloadTime => "download time (s)",
            UpdateKind::DownloadSpeed => "download speed (kb/s)",
            UpdateKind::DownloadComplete => "download complete",
            UpdateKind::OtaUpdateComplete => "ota update complete",
        }
    }

    /// Match free text after trimming and lower-casing.
    pub fn from_message(text: &str) -> Option<Self> {
        let normalized = text.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.message() == normalized)
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A validated progress message.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub key: CompositeKey,
    pub kind: UpdateKind,
    pub fields: FieldSet,
}

/// Decode a raw payload received at `now`.
pub fn decode(payload: &[u8], now: DateTime<Utc>) -> Result<DecodedEvent, DecodeError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| DecodeError::MalformedJson(e.to_string()))?;
    let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

    let key = extract_key(object)?;
    key.validate()
        .map_err(|e| DecodeError::InvalidIdentity(e.to_string()))?;

    let text = object
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let kind = UpdateKind::from_message(text)
        .ok_or_else(|| DecodeError::UnknownMessage(text.trim().to_lowercase()))?;

    let fields = extract_fields(kind, object, now)?;
    Ok(DecodedEvent { key, kind, fields })
}

fn extract_key(object: &Map<String, Value>) -> Result<CompositeKey, DecodeError> {
    let field = |name: &'static str| {
        object
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or(DecodeError::MissingField(name))
    };

    Ok(CompositeKey {
        session_id: field("session_id")?,
        node_mac: field("node_mac")?,
        node_location: field("node_location")?,
        node_type: field("node_type")?,
        node_id: field("node_id")?,
        node_codename: field("node_codename")?,
        firmware_version: field("firmware_version")?,
    })
}

fn data_value<'a>(
    object: &'a Map<String, Value>,
    kind: UpdateKind,
    field: &'static str,
) -> Result<&'a Value, DecodeError> {
    object
        .get("data")
        .and_then(|d| d.get(field))
        .filter(|v| v.is_number())
        .ok_or(DecodeError::MissingData {
            message: kind.message(),
            field,
        })
}

fn data_f64(
    object: &Map<String, Value>,
    kind: UpdateKind,
    field: &'static str,
) -> Result<f64, DecodeError> {
    data_value(object, kind, field)?
        .as_f64()
        .ok_or(DecodeError::MissingData {
            message: kind.message(),
            field,
        })
}

/// Byte counts may arrive as integral floats from some firmware builds.
fn data_u64(
    object: &Map<String, Value>,
    kind: UpdateKind,
    field: &'static str,
) -> Result<u64, DecodeError> {
    let value = data_value(object, kind, field)?;
    value
        .as_u64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        })
        .ok_or(DecodeError::MissingData {
            message: kind.message(),
            field,
        })
}

fn extract_fields(
    kind: UpdateKind,
    object: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<FieldSet, DecodeError> {
    let mut fields = FieldSet::default();
    match kind {
        UpdateKind::OtaUpdateStarted => {
            fields.download_started_at = Some(now);
            fields.flash_status = Some(FlashStatus::InProgress);
        }
        UpdateKind::FirmwareSizeOk => {
            fields.firmware_size_kb = Some(data_f64(object, kind, "size_kb")?)
        }
        UpdateKind::FirmwareBytesWritten => {
            fields.bytes_written = Some(data_u64(object, kind, "bytes")?)
        }
        UpdateKind::DownloadTime => {
            fields.download_duration_sec = Some(data_f64(object, kind, "seconds")?)
        }
        UpdateKind::DownloadSpeed => {
            fields.download_speed_kbps = Some(data_f64(object, kind, "speed_kbps")?)
        }
        UpdateKind::DownloadComplete => fields.download_completed_at = Some(now),
        UpdateKind::OtaUpdateComplete => {
            fields.flash_completed_at = Some(now);
            fields.flash_status = Some(FlashStatus::Success);
        }
    }
    Ok(fields)
}
