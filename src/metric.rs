//! Core metric types produced by collectors
//!
//! A [`Metric`] is a single measurement. Collectors return metrics in batches
//! and the manager moves each batch, unchanged, into the metrics channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type for consistent time handling across the crate
pub type Timestamp = DateTime<Utc>;

/// Label set attached to a metric; keys are unique and kept ordered
pub type Labels = BTreeMap<String, String>;

/// Kind of measurement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonically increasing total
    Counter,
    /// Point-in-time value that may go up or down
    Gauge,
}

/// Coarse classification of a collector and the metrics it produces
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    System,
    Application,
    Database,
    Business,
    Cache,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::System,
        Category::Application,
        Category::Database,
        Category::Business,
        Category::Cache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::System => "system",
            Category::Application => "application",
            Category::Database => "database",
            Category::Business => "business",
            Category::Cache => "cache",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single measurement emitted by a collector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    /// Dotted metric name, e.g. `cpu.usage`
    pub name: String,
    pub kind: MetricKind,
    pub category: Category,
    #[serde(default)]
    pub labels: Labels,
    pub value: f64,
    /// Unit of `value` (`percent`, `bytes`, ...); empty when dimensionless
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
    /// Name of the collector that produced the metric
    pub source: String,
    pub timestamp: Timestamp,
}

impl Metric {
    /// Create a gauge stamped with the current time
    ///
    /// # Example
    ///
    /// ```
    /// use collector_manager::metric::{Category, Metric, MetricKind};
    ///
    /// let metric = Metric::gauge("cpu.usage", 42.0, Category::System)
    ///     .with_unit("percent")
    ///     .with_label("host", "db-1");
    /// assert_eq!(metric.kind, MetricKind::Gauge);
    /// assert_eq!(metric.labels["host"], "db-1");
    /// ```
    pub fn gauge(name: impl Into<String>, value: f64, category: Category) -> Self {
        Self::new(name, MetricKind::Gauge, value, category)
    }

    /// Create a counter stamped with the current time
    pub fn counter(name: impl Into<String>, value: f64, category: Category) -> Self {
        Self::new(name, MetricKind::Counter, value, category)
    }

    fn new(name: impl Into<String>, kind: MetricKind, value: f64, category: Category) -> Self {
        Self {
            name: name.into(),
            kind,
            category,
            labels: Labels::new(),
            value,
            unit: String::new(),
            description: String::new(),
            source: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add every label from `labels`, replacing values of keys already present
    pub fn with_labels<'a, I>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in labels {
            self.labels.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_builder() {
        let metric = Metric::counter("http.requests", 10.0, Category::Application)
            .with_label("route", "/health")
            .with_unit("requests")
            .with_description("Requests served")
            .with_source("application");

        assert_eq!(metric.name, "http.requests");
        assert_eq!(metric.kind, MetricKind::Counter);
        assert_eq!(metric.category, Category::Application);
        assert_eq!(metric.labels.get("route").map(String::as_str), Some("/health"));
        assert_eq!(metric.unit, "requests");
        assert_eq!(metric.source, "application");
    }

    #[test]
    fn test_label_keys_are_unique() {
        let metric = Metric::gauge("mem.usage", 70.0, Category::System)
            .with_label("host", "a")
            .with_label("host", "b");

        assert_eq!(metric.labels.len(), 1);
        assert_eq!(metric.labels["host"], "b");
    }

    #[test]
    fn test_metric_serialization() {
        let metric = Metric::gauge("cpu.usage", 42.0, Category::System)
            .with_unit("percent")
            .with_source("cpu");

        let json = serde_json::to_string(&metric).unwrap();
        let deserialized: Metric = serde_json::from_str(&json).unwrap();
        assert_eq!(metric, deserialized);
        assert!(json.contains("\"kind\":\"gauge\""));
        assert!(json.contains("\"category\":\"system\""));
    }

    #[test]
    fn test_category_serialization() {
        for category in Category::ALL {
            assert_eq!(
                serde_json::to_string(&category).unwrap(),
                format!("\"{}\"", category)
            );
        }
    }
}
