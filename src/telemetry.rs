//! Telemetry data structures and utilities

use crate::errors::ValidationError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label name to value, ordered by name so serialization is deterministic
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) {
        self.0.insert(name.into(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Basic shape check; label name syntax is left to the backend
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.0.keys().any(|name| name.trim().is_empty()) {
            return Err(ValidationError::EmptyLabelName);
        }
        Ok(())
    }

    /// Render as `{a="1",b="2"}`
    pub fn to_selector(&self) -> String {
        let pairs: Vec<String> = self
            .0
            .iter()
            .map(|(name, value)| format!("{}=\"{}\"", name, escape_label_value(value)))
            .collect();
        format!("{{{}}}", pairs.join(","))
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut labels = LabelSet::new();
        for (name, value) in iter {
            labels.insert(name, value);
        }
        labels
    }
}

impl<K: Into<String>, V: ToString, const N: usize> From<[(K, V); N]> for LabelSet {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Cache key identifying one buffer
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn for_stream(labels: &LabelSet) -> Self {
        Fingerprint(labels.to_selector())
    }

    pub fn for_metric(name: &str, labels: &LabelSet) -> Self {
        Fingerprint(format!("{}{}", name, labels.to_selector()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One log line; the timestamp is rendered when the entry is appended
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: String,
    pub line: String,
}

impl LogEntry {
    pub fn new(timestamp: DateTime<Utc>, line: impl Into<String>) -> Self {
        Self {
            ts: render_timestamp(timestamp),
            line: line.into(),
        }
    }

    pub fn from_millis(timestamp_ms: i64, line: impl Into<String>) -> Result<Self, ValidationError> {
        let timestamp = DateTime::from_timestamp_millis(timestamp_ms)
            .ok_or(ValidationError::TimestampOutOfRange(timestamp_ms))?;
        Ok(Self::new(timestamp, line))
    }
}

/// One metric sample, timestamp in milliseconds since the Unix epoch
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: f64,
    pub timestamp: i64,
}

impl Sample {
    pub fn new(value: f64, timestamp: i64) -> Result<Self, ValidationError> {
        if value.is_nan() {
            return Err(ValidationError::NotANumber);
        }
        if DateTime::from_timestamp_millis(timestamp).is_none() {
            return Err(ValidationError::TimestampOutOfRange(timestamp));
        }
        Ok(Self { value, timestamp })
    }
}

/// Identity of a buffer: optional metric name plus its labels
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub name: Option<String>,
    pub labels: LabelSet,
}

/// A `name`/`value` pair in remote-write label order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Series {
    /// Labels as a metric backend expects them, `__name__` first
    pub fn metric_labels(&self) -> Vec<Label> {
        let mut labels = Vec::with_capacity(self.labels.len() + 1);
        if let Some(name) = &self.name {
            labels.push(Label {
                name: "__name__".to_string(),
                value: name.clone(),
            });
        }
        labels.extend(self.labels.iter().map(|(name, value)| Label {
            name: name.to_string(),
            value: value.to_string(),
        }));
        labels
    }
}

/// Immutable copy of a buffer's pending items taken at extraction time
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot<T> {
    pub fingerprint: Fingerprint,
    pub series: Series,
    pub items: Vec<T>,
}

impl<T> Snapshot<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub type StreamSnapshot = Snapshot<LogEntry>;
pub type MetricSnapshot = Snapshot<Sample>;

/// RFC 3339 in UTC with millisecond precision, e.g. `2009-02-13T23:31:30.000Z`
pub fn render_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Get current timestamp in milliseconds since Unix epoch
pub fn current_timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}
