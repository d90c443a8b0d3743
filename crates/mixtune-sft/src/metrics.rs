//! Training metrics logging

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Named scalar metrics for one logging event
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsRecord(BTreeMap<String, f64>);

impl MetricsRecord {
    /// Empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, replacing any earlier value
    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    /// Builder-style [`MetricsRecord::insert`]
    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.insert(key, value);
        self
    }

    /// Value of `key`
    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    /// Whether `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of metrics
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Metrics in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

/// Metrics logger for training
///
/// Emits every record through `tracing` and keeps the history so callers can
/// inspect or persist it.
#[derive(Debug, Clone, Default)]
pub struct MetricsLogger {
    log_interval: usize,
    history: Vec<MetricsRecord>,
}

impl MetricsLogger {
    /// Create a logger that reports every `log_interval` optimizer steps
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval,
            history: Vec::new(),
        }
    }

    /// Whether `step` is a logging step
    pub fn should_log(&self, step: usize) -> bool {
        self.log_interval > 0 && step % self.log_interval == 0
    }

    /// Record and emit metrics
    pub fn log(&mut self, record: MetricsRecord) {
        let fields = record
            .iter()
            .map(|(key, value)| format!("{}={:.6}", key, value))
            .collect::<Vec<_>>()
            .join(", ");
        info!("{}", fields);
        self.history.push(record);
    }

    /// Every record logged so far
    pub fn history(&self) -> &[MetricsRecord] {
        &self.history
    }

    /// Most recent record
    pub fn last(&self) -> Option<&MetricsRecord> {
        self.history.last()
    }
}
