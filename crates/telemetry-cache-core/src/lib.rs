//! Data model shared by the telemetry store, its HTTP adapter and the operator CLI.
//!
//! Nothing in this crate holds shared state. The types here are plain values:
//! the store hands out copies of [`Snapshot`] and [`HistoryEntry`], and the
//! ingestion path turns a loosely-typed [`InboundReport`] into a canonical
//! [`NodeKey`] plus [`Reading`] before anything is recorded.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

/// Retention window used when no explicit configuration is supplied.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TelemetryError {
    #[error("malformed reading: {0}")]
    MalformedReading(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
}

/// Canonical identifier of one reporting node.
///
/// Keys compare by their string form, so a node that reports as `3` and as
/// `"3"` lands on the same key.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    /// Canonicalizes a textual identifier. Surrounding whitespace is dropped;
    /// blank input is not an identifier.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    /// Canonicalizes a JSON identifier. Strings go through [`NodeKey::parse`],
    /// numbers keep their JSON text form. Anything else is rejected.
    #[must_use]
    pub fn from_identifier(value: &Value) -> Option<Self> {
        match value {
            Value::String(raw) => Self::parse(raw),
            Value::Number(number) => Some(Self(number.to_string())),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One ingestion payload. No plausibility checks are applied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
}

/// Most recent reading for a key, stamped at ingestion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    #[serde(flatten)]
    pub reading: Reading,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Snapshot {
    #[must_use]
    pub fn history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            timestamp: self.timestamp,
            temperature: self.reading.temperature,
            humidity: self.reading.humidity,
        }
    }
}

/// One retained point in a key's history window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub temperature: f64,
    pub humidity: f64,
}

impl HistoryEntry {
    #[must_use]
    pub fn reading(&self) -> Reading {
        Reading {
            temperature: self.temperature,
            humidity: self.humidity,
        }
    }
}

/// Fixed-capacity FIFO of history entries, oldest first.
///
/// The backing buffer is allocated once at `capacity` and never grows: when
/// full, the oldest entry is popped before the new one is pushed.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRing {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryRing {
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `entry`, returning the evicted oldest entry when the ring was full.
    pub fn push(&mut self, entry: HistoryEntry) -> Option<HistoryEntry> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn newest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<HistoryEntry> {
        self.entries.iter().copied().collect()
    }
}

/// Inbound report as a device sends it: every field optional and loosely typed.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct InboundReport {
    #[serde(default, alias = "id", alias = "identifier")]
    pub node_id: Option<Value>,
    #[serde(default)]
    pub temperature: Option<Value>,
    #[serde(default)]
    pub humidity: Option<Value>,
}

impl InboundReport {
    /// Decodes a report from an arbitrary JSON document.
    ///
    /// # Errors
    /// Returns [`TelemetryError::MalformedReading`] when the document is not
    /// an object or repeats the identifier under several names.
    pub fn from_value(value: &Value) -> Result<Self, TelemetryError> {
        if !value.is_object() {
            return Err(TelemetryError::MalformedReading(
                "report MUST be a JSON object".to_string(),
            ));
        }
        serde_json::from_value(value.clone())
            .map_err(|err| TelemetryError::MalformedReading(err.to_string()))
    }

    /// Validates field presence and types, producing the canonical key and reading.
    ///
    /// # Errors
    /// Returns [`TelemetryError::MalformedReading`] when the identifier is
    /// missing or unusable, or when either numeric field is missing or not a
    /// number.
    pub fn normalize(&self) -> Result<(NodeKey, Reading), TelemetryError> {
        let Some(raw_id) = self.node_id.as_ref() else {
            return Err(TelemetryError::MalformedReading(
                "node_id MUST be provided".to_string(),
            ));
        };
        let key = NodeKey::from_identifier(raw_id).ok_or_else(|| {
            TelemetryError::MalformedReading(
                "node_id MUST be a non-empty string or a number".to_string(),
            )
        })?;

        let reading = Reading {
            temperature: numeric_field("temperature", self.temperature.as_ref())?,
            humidity: numeric_field("humidity", self.humidity.as_ref())?,
        };

        Ok((key, reading))
    }
}

fn numeric_field(name: &str, value: Option<&Value>) -> Result<f64, TelemetryError> {
    let Some(value) = value else {
        return Err(TelemetryError::MalformedReading(format!(
            "{name} MUST be provided"
        )));
    };
    value
        .as_f64()
        .ok_or_else(|| TelemetryError::MalformedReading(format!("{name} MUST be a number")))
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StoreConfig {
    pub history_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl StoreConfig {
    /// # Errors
    /// Returns [`TelemetryError::Configuration`] when the retention window is empty.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.history_capacity == 0 {
            return Err(TelemetryError::Configuration(
                "history_capacity MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`TelemetryError::Timestamp`] when the value has no RFC3339 form,
/// such as a negative year.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TelemetryError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            TelemetryError::Timestamp(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
