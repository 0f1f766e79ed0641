//! Expiry normalization.
//!
//! Slack and the backup store hand us expiries in several shapes. Everything
//! is converted to `DateTime<Utc>` before it is stored or compared.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeDelta, Utc};

/// An expiry as it arrived at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpiryInput {
    Utc(DateTime<Utc>),
    FixedOffset(DateTime<FixedOffset>),
    /// No offset; interpreted as UTC.
    Naive(NaiveDateTime),
    UnixSeconds(i64),
    UnixSecondsF64(f64),
    /// ISO-8601 / RFC 3339 text, or unix seconds as text.
    Text(String),
}

impl ExpiryInput {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Utc(_) => "utc",
            Self::FixedOffset(_) => "fixed_offset",
            Self::Naive(_) => "naive",
            Self::UnixSeconds(_) => "unix_seconds",
            Self::UnixSecondsF64(_) => "unix_seconds_f64",
            Self::Text(_) => "text",
        }
    }
}

impl From<DateTime<Utc>> for ExpiryInput {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Utc(value)
    }
}

impl From<DateTime<FixedOffset>> for ExpiryInput {
    fn from(value: DateTime<FixedOffset>) -> Self {
        Self::FixedOffset(value)
    }
}

impl From<NaiveDateTime> for ExpiryInput {
    fn from(value: NaiveDateTime) -> Self {
        Self::Naive(value)
    }
}

impl From<i64> for ExpiryInput {
    fn from(value: i64) -> Self {
        Self::UnixSeconds(value)
    }
}

impl From<f64> for ExpiryInput {
    fn from(value: f64) -> Self {
        Self::UnixSecondsF64(value)
    }
}

impl From<&str> for ExpiryInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ExpiryInput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Normalize an expiry to UTC.
///
/// Unparsable input yields `None`, meaning "no expiry". That choice is logged
/// at warn level so it never happens silently.
pub fn normalize_expiry(input: impl Into<ExpiryInput>) -> Option<DateTime<Utc>> {
    let input = input.into();
    let normalized = match &input {
        ExpiryInput::Utc(dt) => Some(*dt),
        ExpiryInput::FixedOffset(dt) => Some(dt.with_timezone(&Utc)),
        ExpiryInput::Naive(dt) => Some(dt.and_utc()),
        ExpiryInput::UnixSeconds(secs) => DateTime::from_timestamp(*secs, 0),
        ExpiryInput::UnixSecondsF64(secs) => from_fractional_seconds(*secs),
        ExpiryInput::Text(text) => parse_text(text.trim()),
    };

    if normalized.is_none() {
        tracing::warn!(
            kind = input.kind(),
            "Unparsable expiry treated as no expiry"
        );
    }
    normalized
}

/// Expiry `expires_in` seconds after `now`. Non-positive values are already expired.
#[must_use]
pub fn expiry_after(now: DateTime<Utc>, expires_in: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_seconds(expires_in).and_then(|delta| now.checked_add_signed(delta))
}

fn from_fractional_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs.abs() > i64::MAX as f64 {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

fn parse_text(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.and_utc());
        }
    }
    if let Ok(secs) = text.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0);
    }
    text.parse::<f64>().ok().and_then(from_fractional_seconds)
}
