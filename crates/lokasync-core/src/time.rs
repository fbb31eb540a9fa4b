//! Timestamp rendering in the configured timezone.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};

/// Wire format for datetimes in outbound messages and CLI output.
pub const WIRE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse an IANA timezone name such as `Asia/Jakarta`.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| Error::Config(format!("Unknown timezone '{}': {}", name, e)))
}

/// Render a UTC instant as local wall-clock time in `tz`.
pub fn format_datetime(dt: &DateTime<Utc>, tz: &Tz) -> String {
    dt.with_timezone(tz).format(WIRE_DATETIME_FORMAT).to_string()
}
