use crate::error::{RegistryError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Half-open validity range `[begin, end)`; a missing bound is unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timespan {
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Timespan {
    pub fn new(begin: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<Self> {
        if let (Some(b), Some(e)) = (begin, end) {
            if e <= b {
                return Err(RegistryError::invalid(format!(
                    "timespan end {} is not after begin {}",
                    format_bound(e),
                    format_bound(b)
                )));
            }
        }
        Ok(Self { begin, end })
    }

    /// Unbounded on both sides.
    pub fn forever() -> Self {
        Self::default()
    }

    pub fn overlaps(&self, other: &Timespan) -> bool {
        let starts_before_other_ends = match (self.begin, other.end) {
            (Some(b), Some(e)) => b < e,
            _ => true,
        };
        let other_starts_before_end = match (other.begin, self.end) {
            (Some(b), Some(e)) => b < e,
            _ => true,
        };
        starts_before_other_ends && other_starts_before_end
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.begin.is_none_or(|b| b <= time) && self.end.is_none_or(|e| time < e)
    }

    /// Parse an RFC 3339 bound; empty strings are unbounded.
    pub fn parse_bound(text: &str) -> Result<Option<DateTime<Utc>>> {
        if text.is_empty() {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(text)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|err| RegistryError::invalid(format!("invalid timestamp '{text}': {err}")))
    }

    pub(crate) fn bound_to_json(bound: Option<DateTime<Utc>>) -> Value {
        bound.map_or(Value::Null, |t| Value::from(format_bound(t)))
    }

    pub(crate) fn bound_from_json(value: Option<&Value>) -> Result<Option<DateTime<Utc>>> {
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Self::parse_bound(text),
            Some(other) => Err(RegistryError::Internal(format!(
                "timespan bound stored as {other}"
            ))),
        }
    }
}

fn format_bound(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let begin = self.begin.map_or_else(|| "-∞".to_string(), format_bound);
        let end = self.end.map_or_else(|| "∞".to_string(), format_bound);
        write!(f, "[{begin}, {end})")
    }
}
