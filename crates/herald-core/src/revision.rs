//! Document revision derivation.
//!
//! A resource names one content field as its change marker. Its value is
//! either a number or a timestamp string; both collapse to a single `i64`
//! at ingestion so the rest of the system only ever compares integers.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::{
    error::{CoreError, Result},
    models::ChangeDetection,
};

/// Revision read from a document's change field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    /// Integer counter, floats truncated.
    Numeric(i64),
    /// Timestamp, compared at nanosecond precision.
    Timestamp(DateTime<Utc>),
}

impl Revision {
    /// Reads the revision from document content.
    ///
    /// # Errors
    ///
    /// Returns `FormatNotSupported` when the field is missing, has an
    /// unsupported JSON type, or holds a string that does not parse with the
    /// configured format or falls outside the nanosecond range.
    pub fn extract(content: &Map<String, Value>, change: &ChangeDetection) -> Result<Self> {
        let value = lookup(content, &change.field).ok_or_else(|| {
            CoreError::FormatNotSupported(format!("change field `{}` is missing", change.field))
        })?;

        match value {
            Value::Number(number) => {
                if let Some(n) = number.as_i64() {
                    return Ok(Self::Numeric(n));
                }
                match number.as_f64() {
                    Some(f) if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                        Ok(Self::Numeric(f.trunc() as i64))
                    },
                    _ => Err(CoreError::FormatNotSupported(format!(
                        "number {number} does not fit a revision"
                    ))),
                }
            },
            Value::String(s) => {
                let timestamp = parse_timestamp(s, &change.format)?;
                if timestamp.timestamp_nanos_opt().is_none() {
                    return Err(CoreError::FormatNotSupported(format!(
                        "timestamp `{s}` is out of range"
                    )));
                }
                Ok(Self::Timestamp(timestamp))
            },
            other => Err(CoreError::FormatNotSupported(format!(
                "change field `{}` holds unsupported value {other}",
                change.field
            ))),
        }
    }

    /// Collapses the revision to the comparable integer form.
    pub fn value(self) -> i64 {
        match self {
            Self::Numeric(n) => n,
            Self::Timestamp(ts) => ts.timestamp_nanos_opt().unwrap_or(i64::MAX),
        }
    }
}

/// Derives the integer revision of a document in one step.
///
/// # Errors
///
/// See [`Revision::extract`].
pub fn derive(content: &Map<String, Value>, change: &ChangeDetection) -> Result<i64> {
    Revision::extract(content, change).map(Revision::value)
}

fn lookup<'a>(content: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    if let Some(value) = content.get(field) {
        return Some(value);
    }

    let mut parts = field.split('.');
    let mut current = content.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn parse_timestamp(s: &str, format: &str) -> Result<DateTime<Utc>> {
    if format.is_empty() {
        return DateTime::parse_from_rfc3339(s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| CoreError::FormatNotSupported(format!("`{s}` is not RFC 3339: {e}")));
    }

    if let Ok(ts) = DateTime::parse_from_str(s, format) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, format) {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    Err(CoreError::FormatNotSupported(format!("`{s}` does not match format `{format}`")))
}
