//! Cross-fold inference merger
//!
//! Every event is scored by the model trained on the *other* fold:
//!
//! ```text
//! event mod 2 == 0  ->  model_fold1
//! event mod 2 == 1  ->  model_fold0
//! ```
//!
//! Each fold's events are gathered, scored in one pass, and scattered back
//! into their original positions, so the output is ordered exactly like the
//! input stream. A position left unfilled after scattering is a fatal
//! consistency error.

use crate::config::PipelineConfig;
use crate::fold::{Fold, Workdir};
use crate::model::FoldModel;
use crate::source::{SourceContext, SourceLayout};
use crate::storage::{column_f64, column_u64, write_batches_atomic};
use crate::{Error, Result};
use arrow::array::{ArrayRef, Float32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Event key column of the score output
pub const EVENT_COLUMN: &str = "event";
/// Best-class probability column
pub const SCORE_COLUMN: &str = "ml_score";
/// Best-class index column
pub const INDEX_COLUMN: &str = "ml_index";

/// Anything that maps row-major inputs to class probabilities
pub trait Scorer {
    /// Width of each probability row
    fn num_classes(&self) -> usize;

    /// Row-major probabilities (`rows x num_classes`)
    ///
    /// # Errors
    /// Implementation-defined
    fn predict_proba(&self, inputs: &[f32]) -> Result<Vec<f32>>;
}

impl Scorer for FoldModel {
    fn num_classes(&self) -> usize {
        self.classes().len()
    }

    fn predict_proba(&self, inputs: &[f32]) -> Result<Vec<f32>> {
        Self::predict_proba(self, inputs)
    }
}

/// Score of one event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreRecord {
    /// Event identifier
    pub event: u64,
    /// Highest class probability
    pub score: f32,
    /// Index of that class
    pub index: usize,
}

/// Maximum value and its first position
fn argmax(row: &[f32]) -> (f32, usize) {
    row.iter()
        .enumerate()
        .fold((f32::NEG_INFINITY, 0), |(best, at), (i, &p)| {
            if p > best {
                (p, i)
            } else {
                (best, at)
            }
        })
}

/// Score every event with the model of the opposite fold
///
/// `models` is indexed by the fold each model was *trained* on. The output
/// has one record per event, in input order.
///
/// # Errors
/// Returns `InvalidInput` on shape mismatch and `CountMismatch` if the folds
/// do not partition the events or a scorer returns the wrong number of rows
pub fn cross_apply<S: Scorer + ?Sized>(
    models: [&S; 2],
    inputs: &[f32],
    num_variables: usize,
    events: &[u64],
) -> Result<Vec<ScoreRecord>> {
    let total = events.len();
    if num_variables == 0 || inputs.len() != total * num_variables {
        return Err(Error::InvalidInput(format!(
            "Expected {total} rows of {num_variables} inputs, got {} values",
            inputs.len()
        )));
    }
    let num_classes = models[0].num_classes();
    if models[1].num_classes() != num_classes {
        return Err(Error::InvalidInput(format!(
            "Fold models disagree on the number of classes: {num_classes} vs {}",
            models[1].num_classes()
        )));
    }

    let positions: [Vec<usize>; 2] = Fold::ALL.map(|fold| {
        (0..total)
            .filter(|&i| Fold::of_event(events[i]) == fold)
            .collect()
    });
    let (n0, n1) = (positions[0].len(), positions[1].len());
    if n0 + n1 != total {
        error!(fold0 = n0, fold1 = n1, total, "Folds do not partition the events");
        return Err(Error::CountMismatch {
            context: "fold partition".to_string(),
            expected: total,
            actual: n0 + n1,
        });
    }
    debug!(fold0 = n0, fold1 = n1, total, "Fold assignment");

    let mut merged: Vec<Option<ScoreRecord>> = vec![None; total];
    for fold in Fold::ALL {
        let rows = &positions[fold_slot(fold)];
        if rows.is_empty() {
            continue;
        }
        let mut gathered = Vec::with_capacity(rows.len() * num_variables);
        for &i in rows {
            gathered.extend_from_slice(&inputs[i * num_variables..(i + 1) * num_variables]);
        }

        let scorer = models[fold_slot(fold.opposite())];
        let proba = scorer.predict_proba(&gathered)?;
        if proba.len() != rows.len() * num_classes {
            return Err(Error::CountMismatch {
                context: format!("scores of fold {fold}"),
                expected: rows.len() * num_classes,
                actual: proba.len(),
            });
        }

        for (&i, row) in rows.iter().zip(proba.chunks_exact(num_classes)) {
            let (score, index) = argmax(row);
            merged[i] = Some(ScoreRecord {
                event: events[i],
                score,
                index,
            });
        }
    }

    let unfilled = merged.iter().filter(|r| r.is_none()).count();
    if unfilled > 0 {
        return Err(Error::CountMismatch {
            context: "scattered scores".to_string(),
            expected: total,
            actual: total - unfilled,
        });
    }
    Ok(merged.into_iter().flatten().collect())
}

#[allow(clippy::cast_possible_truncation)]
const fn fold_slot(fold: Fold) -> usize {
    fold.index() as usize
}

/// Schema of the score output
#[must_use]
pub fn score_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(EVENT_COLUMN, DataType::UInt64, false),
        Field::new(SCORE_COLUMN, DataType::Float32, false),
        Field::new(INDEX_COLUMN, DataType::Float32, false),
    ]))
}

/// Convert scores to an Arrow batch
///
/// # Errors
/// Returns error if the batch cannot be assembled
#[allow(clippy::cast_precision_loss)]
pub fn to_record_batch(records: &[ScoreRecord]) -> Result<RecordBatch> {
    let events: UInt64Array = records.iter().map(|r| r.event).collect::<Vec<_>>().into();
    let scores: Float32Array = records.iter().map(|r| r.score).collect::<Vec<_>>().into();
    let indices: Float32Array = records
        .iter()
        .map(|r| r.index as f32)
        .collect::<Vec<_>>()
        .into();
    let columns: Vec<ArrayRef> = vec![Arc::new(events), Arc::new(scores), Arc::new(indices)];
    Ok(RecordBatch::try_new(score_schema(), columns)?)
}

/// Row-major `f32` matrix of the given columns
///
/// # Errors
/// Returns error if a column is missing or not numeric
#[allow(clippy::cast_possible_truncation)]
pub fn input_matrix(batch: &RecordBatch, variables: &[String]) -> Result<Vec<f32>> {
    let columns = variables
        .iter()
        .map(|v| column_f64(batch, v))
        .collect::<Result<Vec<_>>>()?;
    let mut inputs = Vec::with_capacity(batch.num_rows() * variables.len());
    for row in 0..batch.num_rows() {
        inputs.extend(columns.iter().map(|c| c[row] as f32));
    }
    Ok(inputs)
}

/// What an inference pass produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Score files written
    pub written: Vec<PathBuf>,
    /// `(source_id, variant)` pairs skipped because the variant is absent
    pub skipped: Vec<(String, String)>,
}

/// Score every configured source and variant with the given fold models
///
/// # Errors
/// Returns `MissingInput` for an absent source directory or friend file,
/// plus every error of [`cross_apply`]; absent variants are skipped
pub fn apply_all<S: Scorer + ?Sized>(
    config: &PipelineConfig,
    workdir: &Workdir,
    models: [&S; 2],
) -> Result<ApplySummary> {
    let mut summary = ApplySummary::default();
    let variants = config.apply_variants();

    for source_id in &config.apply_sources {
        let mut context = SourceContext::new(config.layout());
        info!(source = %source_id, "Process source");

        for variant in &variants {
            if !context.variant_available(source_id, variant)? {
                warn!(
                    source = %source_id,
                    variant = %variant,
                    path = %SourceLayout::variant_path(&config.ntuples_base, source_id, variant).display(),
                    "Variant does not exist, skipping"
                );
                summary.skipped.push((source_id.clone(), variant.clone()));
                continue;
            }

            let dataset = context.dataset(std::slice::from_ref(source_id), variant)?;
            let events = column_u64(&dataset, &config.event_key)?;
            let inputs = input_matrix(&dataset, &config.variables)?;
            let records = cross_apply(models, &inputs, config.variables.len(), &events)?;

            let dir = workdir.scores_dir(source_id);
            fs::create_dir_all(&dir)?;
            let path = dir.join(format!("{variant}.parquet"));
            write_batches_atomic(&path, &score_schema(), &[to_record_batch(&records)?])?;
            info!(
                source = %source_id,
                variant = %variant,
                events = records.len(),
                path = %path.display(),
                "Wrote scores"
            );
            summary.written.push(path);
        }
        context.close();
    }
    Ok(summary)
}

/// Load both fold models and score every configured source
///
/// # Errors
/// Returns `MissingInput` if a model artifact is absent, `InvalidInput` if a
/// model was trained on different variables or classes, plus every error of
/// [`apply_all`]
pub fn apply(config: &PipelineConfig, workdir: &Workdir) -> Result<ApplySummary> {
    let models = [
        FoldModel::load(workdir, Fold::Zero)?,
        FoldModel::load(workdir, Fold::One)?,
    ];
    for model in &models {
        if model.variables() != config.variables.as_slice()
            || model.classes() != config.classes.as_slice()
        {
            return Err(Error::InvalidInput(format!(
                "Fold {} model was trained on variables {:?} and classes {:?}",
                model.fold(),
                model.variables(),
                model.classes()
            )));
        }
    }
    apply_all(config, workdir, [&models[0], &models[1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::Cell;

    /// Puts all probability on the class equal to its training fold and
    /// counts rows scored
    struct FoldMarker {
        trained_on: usize,
        rows: Cell<usize>,
    }

    impl FoldMarker {
        fn new(trained_on: usize) -> Self {
            Self {
                trained_on,
                rows: Cell::new(0),
            }
        }
    }

    impl Scorer for FoldMarker {
        fn num_classes(&self) -> usize {
            2
        }

        fn predict_proba(&self, inputs: &[f32]) -> Result<Vec<f32>> {
            self.rows.set(self.rows.get() + inputs.len());
            Ok(inputs
                .iter()
                .flat_map(|_| {
                    if self.trained_on == 0 {
                        [0.9, 0.1]
                    } else {
                        [0.2, 0.8]
                    }
                })
                .collect())
        }
    }

    /// Returns one row too few
    struct Truncating;

    impl Scorer for Truncating {
        fn num_classes(&self) -> usize {
            2
        }

        fn predict_proba(&self, inputs: &[f32]) -> Result<Vec<f32>> {
            Ok(vec![0.5; inputs.len().saturating_sub(1) * 2])
        }
    }

    #[test]
    fn test_four_event_scenario() {
        let fold0 = FoldMarker::new(0);
        let fold1 = FoldMarker::new(1);
        let events = [1, 2, 3, 4];
        let inputs = [10.0, 20.0, 30.0, 40.0];
        let records = cross_apply([&fold0, &fold1], &inputs, 1, &events).unwrap();

        assert_eq!(records.len(), 4);
        assert_eq!(
            records.iter().map(|r| r.event).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        // Events 1 and 3 by the fold-0 model, 2 and 4 by the fold-1 model
        assert_eq!(
            records.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![0, 1, 0, 1]
        );
        assert!((records[0].score - 0.9).abs() < f32::EPSILON);
        assert!((records[1].score - 0.8).abs() < f32::EPSILON);
        assert_eq!(fold0.rows.get(), 2);
        assert_eq!(fold1.rows.get(), 2);
    }

    #[test]
    fn test_single_fold_input() {
        let fold0 = FoldMarker::new(0);
        let fold1 = FoldMarker::new(1);
        let records = cross_apply([&fold0, &fold1], &[1.0, 2.0], 1, &[6, 8]).unwrap();
        assert!(records.iter().all(|r| r.index == 1));
        assert_eq!(fold0.rows.get(), 0);
    }

    #[test]
    fn test_empty_input() {
        let fold0 = FoldMarker::new(0);
        let fold1 = FoldMarker::new(1);
        assert!(cross_apply([&fold0, &fold1], &[], 3, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_shape_mismatch() {
        let fold0 = FoldMarker::new(0);
        let fold1 = FoldMarker::new(1);
        let err = cross_apply([&fold0, &fold1], &[1.0, 2.0, 3.0], 2, &[1, 2]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_short_scorer_output_is_fatal() {
        let err = cross_apply([&Truncating, &Truncating], &[1.0, 2.0, 3.0], 1, &[1, 3, 5])
            .unwrap_err();
        assert!(matches!(err, Error::CountMismatch { .. }));
    }

    #[test]
    fn test_argmax_takes_first_maximum() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), (0.4, 1));
        assert_eq!(argmax(&[0.7, 0.3]), (0.7, 0));
    }

    #[test]
    fn test_record_batch_layout() {
        let records = [
            ScoreRecord { event: 7, score: 0.6, index: 2 },
            ScoreRecord { event: 8, score: 0.9, index: 0 },
        ];
        let batch = to_record_batch(&records).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema(), score_schema());
        assert_eq!(column_u64(&batch, EVENT_COLUMN).unwrap(), vec![7, 8]);
        assert_eq!(column_f64(&batch, INDEX_COLUMN).unwrap(), vec![2.0, 0.0]);
    }

    proptest! {
        #[test]
        fn prop_every_event_scored_by_opposite_fold(
            events in prop::collection::vec(any::<u64>(), 0..200),
        ) {
            let fold0 = FoldMarker::new(0);
            let fold1 = FoldMarker::new(1);
            #[allow(clippy::cast_precision_loss)]
            let inputs: Vec<f32> = events.iter().map(|&e| (e % 1000) as f32).collect();
            let records = cross_apply([&fold0, &fold1], &inputs, 1, &events).unwrap();

            prop_assert_eq!(records.len(), events.len());
            for (record, &event) in records.iter().zip(&events) {
                prop_assert_eq!(record.event, event);
                prop_assert!(record.index < 2);
                let scored_by = record.index;
                prop_assert_eq!(scored_by, fold_slot(Fold::of_event(event).opposite()));
                prop_assert!(record.score > 0.0);
            }
            prop_assert_eq!(fold0.rows.get() + fold1.rows.get(), events.len());
        }
    }
}
