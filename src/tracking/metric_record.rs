//! Metric Record - time-series metrics for training runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metric Record represents a single metric data point.
///
/// Metrics are ordered by `step` (the optimizer step at which the
/// validation check ran) and tagged with wall-clock time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRecord {
    key: String,
    step: u64,
    value: f64,
    timestamp: DateTime<Utc>,
}

impl MetricRecord {
    /// Create a new metric record stamped with the current time.
    ///
    /// # Arguments
    ///
    /// * `key` - Metric name (e.g., "`val_loss`", "patience")
    /// * `step` - Training step
    /// * `value` - Metric value
    #[must_use]
    pub fn new(key: impl Into<String>, step: u64, value: f64) -> Self {
        Self {
            key: key.into(),
            step,
            value,
            timestamp: Utc::now(),
        }
    }

    /// Get the metric key/name.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the step number.
    #[must_use]
    pub const fn step(&self) -> u64 {
        self.step
    }

    /// Get the metric value.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// Get the timestamp when the metric was recorded.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
