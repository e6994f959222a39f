//! Sample builder
//!
//! Two halves:
//!
//! 1. **Collection** ([`collect_samples`]): for every process, scan its merged
//!    sources under the compiled cut, once per fold, derive the weight column
//!    and append the projected rows to the `(class, fold)` artifact
//!    `<class>_fold<f>.parquet`.
//! 2. **Assembly** ([`TrainingSample::load`]): read the class artifacts of one
//!    fold, stack them into one feature matrix with one-hot targets, and
//!    optionally apply class-weight normalization.
//!
//! ## Class-weight normalization
//!
//! Each class is rescaled so that its weight sum equals the weight sum of the
//! whole unnormalized sample:
//!
//! ```text
//! w_i <- w_i / S_class(i) * S_total
//! ```
//!
//! Every class therefore contributes the same total weight; the aggregate is
//! `num_classes * S_total`. Only relative weights matter to the loss.

use crate::config::PipelineConfig;
use crate::fold::{staging_path, Artifact, Fold, Workdir};
use crate::scan::{ScanPool, ScanRequest};
use crate::selection::{compile, Selection};
use crate::source::SourceContext;
use crate::storage::{column_f64, StorageEngine};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};
use trueno::Vector;

/// One physics process feeding a training class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Process name (e.g. `ggh`)
    pub name: String,
    /// Training class the process is assigned to (e.g. `htt`)
    pub class: String,
    /// Source ids chained into the primary stream
    pub sources: Vec<String>,
    /// Selection hierarchy (channel, MC, process, ...)
    #[serde(default)]
    pub selections: Vec<Selection>,
}

/// Sum of weights (Kahan-compensated SIMD reduction)
#[must_use]
pub fn weight_sum(weights: &[f32]) -> f32 {
    if weights.is_empty() {
        return 0.0;
    }
    // Kahan summation misbehaves on non-finite input
    if weights.iter().any(|w| !w.is_finite()) {
        return weights.iter().sum();
    }
    Vector::from_slice(weights)
        .sum_kahan()
        .unwrap_or_else(|_| weights.iter().sum())
}

/// Events of one class: features, weights and the class label
#[derive(Debug, Clone, PartialEq)]
pub struct ClassSample {
    /// Class name
    pub class: String,
    /// Class index
    pub label: usize,
    /// Row-major feature matrix (`events x num_variables`)
    pub inputs: Vec<f32>,
    /// Per-event weights
    pub weights: Vec<f32>,
    /// Number of feature variables
    pub num_variables: usize,
}

impl ClassSample {
    /// Extract features and weights of one class from a batch
    ///
    /// # Errors
    /// Returns error if a variable or the weight column is missing
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_batch(
        batch: &RecordBatch,
        class: &str,
        label: usize,
        variables: &[String],
        weight_column: &str,
    ) -> Result<Self> {
        let rows = batch.num_rows();
        let columns = variables
            .iter()
            .map(|v| column_f64(batch, v))
            .collect::<Result<Vec<_>>>()?;

        let mut inputs = Vec::with_capacity(rows * variables.len());
        for row in 0..rows {
            inputs.extend(columns.iter().map(|c| c[row] as f32));
        }
        let weights = column_f64(batch, weight_column)?
            .into_iter()
            .map(|w| w as f32)
            .collect();

        Ok(Self {
            class: class.to_string(),
            label,
            inputs,
            weights,
            num_variables: variables.len(),
        })
    }

    /// Number of events
    #[must_use]
    pub fn num_events(&self) -> usize {
        self.weights.len()
    }
}

/// Stacked, labeled sample of one fold
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    /// Row-major feature matrix (`events x num_variables`)
    pub inputs: Vec<f32>,
    /// Row-major one-hot targets (`events x num_classes`)
    pub targets: Vec<f32>,
    /// Class index per event
    pub labels: Vec<usize>,
    /// Per-event weights
    pub weights: Vec<f32>,
    /// Number of feature variables
    pub num_variables: usize,
    /// Number of classes (one-hot width)
    pub num_classes: usize,
}

impl TrainingSample {
    /// Stack class samples in the given order
    ///
    /// # Errors
    /// Returns `InvalidInput` on inconsistent widths or out-of-range labels
    pub fn stack(classes: Vec<ClassSample>, num_classes: usize) -> Result<Self> {
        let num_variables = classes.first().map_or(0, |c| c.num_variables);
        let total: usize = classes.iter().map(ClassSample::num_events).sum();

        let mut sample = Self {
            inputs: Vec::with_capacity(total * num_variables),
            targets: Vec::with_capacity(total * num_classes),
            labels: Vec::with_capacity(total),
            weights: Vec::with_capacity(total),
            num_variables,
            num_classes,
        };

        for class in classes {
            if class.num_variables != num_variables {
                return Err(Error::InvalidInput(format!(
                    "Class {} has {} variables, expected {num_variables}",
                    class.class, class.num_variables
                )));
            }
            if class.label >= num_classes {
                return Err(Error::InvalidInput(format!(
                    "Class {} has label {} but only {num_classes} classes exist",
                    class.class, class.label
                )));
            }
            let n = class.num_events();
            sample.inputs.extend_from_slice(&class.inputs);
            sample.weights.extend_from_slice(&class.weights);
            sample.labels.extend(std::iter::repeat(class.label).take(n));
            for _ in 0..n {
                let mut one_hot = vec![0.0; num_classes];
                one_hot[class.label] = 1.0;
                sample.targets.extend(one_hot);
            }
        }

        debug!(
            events = sample.num_events(),
            variables = num_variables,
            "Stacked input dataset"
        );
        Ok(sample)
    }

    /// Number of events
    #[must_use]
    pub fn num_events(&self) -> usize {
        self.labels.len()
    }

    /// Feature row of one event
    #[must_use]
    pub fn row(&self, event: usize) -> &[f32] {
        let start = event * self.num_variables;
        &self.inputs[start..start + self.num_variables]
    }

    /// Sum of all weights
    #[must_use]
    pub fn total_weight(&self) -> f32 {
        weight_sum(&self.weights)
    }

    /// Sum of weights of one class
    #[must_use]
    pub fn class_weight(&self, label: usize) -> f32 {
        let class: Vec<f32> = self
            .labels
            .iter()
            .zip(&self.weights)
            .filter(|(&l, _)| l == label)
            .map(|(_, &w)| w)
            .collect();
        weight_sum(&class)
    }

    /// Rescale weights so every class sums to the unnormalized total
    ///
    /// # Errors
    /// Returns `InvalidInput` if a class has zero (or non-finite) total weight
    pub fn normalize_class_weights(&mut self) -> Result<()> {
        let sum_all = f64::from(self.total_weight());
        for label in 0..self.num_classes {
            let sum_class = f64::from(self.class_weight(label));
            if sum_class == 0.0 || !sum_class.is_finite() {
                return Err(Error::InvalidInput(format!(
                    "Class {label} has total weight {sum_class}; cannot normalize"
                )));
            }
            let factor = sum_all / sum_class;
            for (w, _) in self
                .weights
                .iter_mut()
                .zip(&self.labels)
                .filter(|(_, &l)| l == label)
            {
                #[allow(clippy::cast_possible_truncation)]
                let scaled = (f64::from(*w) * factor) as f32;
                *w = scaled;
            }
        }
        debug!(
            events = self.num_events(),
            sum = self.total_weight(),
            "Weights, with class weights"
        );
        Ok(())
    }

    /// Copy of the events at `indices`, in that order
    #[must_use]
    pub fn subset(&self, indices: &[usize]) -> Self {
        let mut out = Self {
            inputs: Vec::with_capacity(indices.len() * self.num_variables),
            targets: Vec::with_capacity(indices.len() * self.num_classes),
            labels: Vec::with_capacity(indices.len()),
            weights: Vec::with_capacity(indices.len()),
            num_variables: self.num_variables,
            num_classes: self.num_classes,
        };
        for &i in indices {
            out.inputs.extend_from_slice(self.row(i));
            let t = i * self.num_classes;
            out.targets
                .extend_from_slice(&self.targets[t..t + self.num_classes]);
            out.labels.push(self.labels[i]);
            out.weights.push(self.weights[i]);
        }
        out
    }

    /// Load the class artifacts of one fold and assemble the training sample
    ///
    /// Classes are labeled by their position in `classes`.
    ///
    /// # Errors
    /// Returns `MissingInput` if a class artifact is absent
    pub fn load(
        workdir: &Workdir,
        fold: Fold,
        classes: &[String],
        variables: &[String],
        weight_column: &str,
        use_class_weights: bool,
    ) -> Result<Self> {
        let mut parts = Vec::with_capacity(classes.len());
        for (label, class) in classes.iter().enumerate() {
            let path = workdir.existing_artifact(&Artifact::Sample(class.clone()), fold)?;
            let storage = StorageEngine::load_parquet(&path)?;
            let batch = match storage.schema() {
                Some(_) => storage.concat()?,
                None => {
                    return Err(Error::InvalidInput(format!(
                        "Sample {} contains no record batches",
                        path.display()
                    )))
                }
            };
            let part = ClassSample::from_batch(&batch, class, label, variables, weight_column)?;
            debug!(class = %class, events = part.num_events(), "Loaded class sample");
            parts.push(part);
        }

        let mut sample = Self::stack(parts, classes.len())?;
        debug!(
            events = sample.num_events(),
            sum = sample.total_weight(),
            "Weights, without class weights"
        );
        if use_class_weights {
            sample.normalize_class_weights()?;
        }
        Ok(sample)
    }
}

/// Row counts written per `(class, fold)` artifact
pub type CollectionSummary = BTreeMap<(String, Fold), usize>;

/// Scan every process and write one sample artifact per `(class, fold)`
///
/// # Errors
/// Returns error on any missing source, invalid expression or write failure.
/// Samples of an earlier collection are removed first and the new ones are
/// renamed into place only once all of them are written, so a failed run
/// leaves no sample artifact behind.
pub fn collect_samples(
    config: &PipelineConfig,
    workdir: &Workdir,
    pool: &ScanPool,
) -> Result<CollectionSummary> {
    for class in &config.classes {
        for fold in Fold::ALL {
            if workdir.remove_artifact(&Artifact::Sample(class.clone()), fold)? {
                debug!(class = %class, fold = %fold, "Removed stale sample");
            }
        }
    }

    let mut groups: BTreeMap<(String, Fold), StorageEngine> = BTreeMap::new();
    let mut context = SourceContext::new(config.layout());

    for process in &config.processes {
        let compiled = compile(&process.selections);
        let (cut, weight) = compiled.expressions()?;
        let dataset = context.dataset(&process.sources, &config.nominal_variant)?;
        info!(
            process = %process.name,
            class = %process.class,
            events = dataset.num_rows(),
            "Create dataset"
        );
        debug!(cut = %compiled.cut, weight = %compiled.weight, "Compiled selection");
        let dataset = StorageEngine::new(vec![dataset]);

        for fold in Fold::ALL {
            let request = ScanRequest {
                key: config.event_key.clone(),
                fold: Some(fold),
                cut: cut.clone(),
                weight: Some((config.weight_column.clone(), weight.clone())),
                variables: config.variables.clone(),
            };
            let selected = pool.scan(&dataset, &request)?;
            debug!(
                process = %process.name,
                fold = %fold,
                events = selected.num_rows(),
                "Selected events"
            );
            groups
                .entry((process.class.clone(), fold))
                .or_default()
                .append_batch(selected)?;
        }
    }
    context.close();

    // Every artifact is staged before any is finalized
    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(groups.len());
    let mut summary = CollectionSummary::new();
    for ((class, fold), storage) in groups {
        let path = workdir.artifact(&Artifact::Sample(class.clone()), fold);
        let tmp = staging_path(&path);
        if let Err(e) = storage.write_parquet(&tmp) {
            discard_staged(&staged);
            return Err(e);
        }
        debug!(class = %class, fold = %fold, path = %tmp.display(), "Staged sample");
        summary.insert((class, fold), storage.num_rows());
        staged.push((tmp, path));
    }

    for (i, (tmp, path)) in staged.iter().enumerate() {
        if let Err(e) = fs::rename(tmp, path) {
            discard_staged(&staged[i..]);
            return Err(e.into());
        }
    }
    for ((class, fold), events) in &summary {
        info!(class = %class, fold = %fold, events, "Wrote sample");
    }
    Ok(summary)
}

fn discard_staged(staged: &[(PathBuf, PathBuf)]) {
    for (tmp, _) in staged {
        fs::remove_file(tmp).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn class(label: usize, weights: Vec<f32>) -> ClassSample {
        let n = weights.len();
        #[allow(clippy::cast_precision_loss)]
        let inputs = (0..n * 2).map(|i| (label * 100 + i) as f32).collect();
        ClassSample {
            class: format!("c{label}"),
            label,
            inputs,
            weights,
            num_variables: 2,
        }
    }

    #[test]
    fn test_stack_one_hot() {
        let sample =
            TrainingSample::stack(vec![class(0, vec![1.0]), class(1, vec![2.0, 3.0])], 2).unwrap();
        assert_eq!(sample.num_events(), 3);
        assert_eq!(sample.labels, vec![0, 1, 1]);
        assert_eq!(sample.targets, vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0]);
        assert_eq!(sample.row(1), &[100.0, 101.0]);
    }

    #[test]
    fn test_stack_rejects_bad_label() {
        assert!(TrainingSample::stack(vec![class(2, vec![1.0])], 2).is_err());
    }

    #[test]
    fn test_normalize_equalizes_classes() {
        let mut sample = TrainingSample::stack(
            vec![class(0, vec![1.0, 1.0, 1.0]), class(1, vec![0.5])],
            2,
        )
        .unwrap();
        let total = sample.total_weight();
        sample.normalize_class_weights().unwrap();

        assert!((sample.class_weight(0) - total).abs() < 1e-5);
        assert!((sample.class_weight(1) - total).abs() < 1e-5);
        assert!((sample.weights[3] - 3.5).abs() < 1e-5);
    }

    #[test]
    fn test_normalize_balanced_sample_keeps_relative_weights() {
        // Two classes, two events each, unit weights: already balanced
        let mut sample =
            TrainingSample::stack(vec![class(0, vec![1.0, 1.0]), class(1, vec![1.0, 1.0])], 2)
                .unwrap();
        sample.normalize_class_weights().unwrap();
        let first = sample.weights[0];
        assert!(sample.weights.iter().all(|&w| (w - first).abs() < 1e-6));
        assert!((first - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_class_fails() {
        let mut sample =
            TrainingSample::stack(vec![class(0, vec![1.0]), class(1, vec![0.0])], 2).unwrap();
        assert!(matches!(
            sample.normalize_class_weights(),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_subset_copies_rows() {
        let sample =
            TrainingSample::stack(vec![class(0, vec![1.0]), class(1, vec![2.0, 3.0])], 2).unwrap();
        let sub = sample.subset(&[2, 0]);
        assert_eq!(sub.labels, vec![1, 0]);
        assert_eq!(sub.weights, vec![3.0, 1.0]);
        assert_eq!(sub.row(0), sample.row(2));
        assert_eq!(sub.targets, vec![0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_weight_sum_empty() {
        assert!(weight_sum(&[]).abs() < f32::EPSILON);
        assert!((weight_sum(&[0.5, 0.25]) - 0.75).abs() < 1e-6);
    }

    proptest! {
        /// Property: after normalization every class sums to the raw total
        #[test]
        fn prop_class_normalization_invariant(
            a in prop::collection::vec(0.01f32..10.0, 1..200),
            b in prop::collection::vec(0.01f32..10.0, 1..200),
        ) {
            let mut sample = TrainingSample::stack(vec![class(0, a), class(1, b)], 2).unwrap();
            let total = sample.total_weight();
            sample.normalize_class_weights().unwrap();

            for label in 0..2 {
                let rel = (sample.class_weight(label) - total).abs() / total;
                prop_assert!(rel < 1e-4, "class {} off by {}", label, rel);
            }
        }
    }
}
