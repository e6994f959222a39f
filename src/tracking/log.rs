//! Training log - run record plus validation time-series, persisted per fold

use super::{MetricRecord, RunRecord};
use crate::fold::{read_json, write_json_atomic, Fold};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Metric key for the last mini-batch loss before a validation check
pub const TRAIN_LOSS: &str = "train_loss";
/// Metric key for the full validation-partition loss
pub const VAL_LOSS: &str = "val_loss";
/// Metric key for the remaining patience
pub const PATIENCE: &str = "patience";

/// Per-fold training log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingLog {
    run: RunRecord,
    metrics: Vec<MetricRecord>,
}

impl TrainingLog {
    /// Create an empty log for a fold.
    #[must_use]
    pub const fn new(fold: Fold, seed: u64) -> Self {
        Self {
            run: RunRecord::new(fold, seed),
            metrics: Vec::new(),
        }
    }

    /// Run record.
    #[must_use]
    pub const fn run(&self) -> &RunRecord {
        &self.run
    }

    /// Mutable run record.
    pub fn run_mut(&mut self) -> &mut RunRecord {
        &mut self.run
    }

    /// Number of metric points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// True if no metric was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Record one validation check.
    pub fn log_validation(&mut self, step: u64, train_loss: f32, val_loss: f32, patience: usize) {
        self.metrics
            .push(MetricRecord::new(TRAIN_LOSS, step, f64::from(train_loss)));
        self.metrics
            .push(MetricRecord::new(VAL_LOSS, step, f64::from(val_loss)));
        #[allow(clippy::cast_precision_loss)]
        let patience = patience as f64;
        self.metrics.push(MetricRecord::new(PATIENCE, step, patience));
    }

    /// Metrics for one key, ordered by step.
    #[must_use]
    pub fn metrics(&self, key: &str) -> Vec<MetricRecord> {
        let mut metrics: Vec<MetricRecord> = self
            .metrics
            .iter()
            .filter(|m| m.key() == key)
            .cloned()
            .collect();

        // Sort by step for time-series ordering
        metrics.sort_by_key(MetricRecord::step);

        metrics
    }

    /// Write the log atomically as JSON.
    ///
    /// # Errors
    /// Returns error on serialization or IO failure
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Read a log written by [`TrainingLog::save`].
    ///
    /// # Errors
    /// Returns error if the file is missing or malformed
    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }
}
