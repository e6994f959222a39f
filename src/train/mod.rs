//! Training controller
//!
//! One run per fold, driven through a small state machine:
//!
//! ```text
//! Init -> Training <-> Validating -> Converged -> Stopped
//! ```
//!
//! - **Init**: remove the model and scaler of an earlier run, split the
//!   sample into train/validation partitions with the injected RNG, fit the
//!   [`StandardScaler`] on the train partition only, initialize the
//!   classifier. The scaler is persisted next to the first checkpoint, so a
//!   run that never checkpoints leaves neither behind.
//! - **Training**: Adam updates on mini-batches drawn with replacement from
//!   the train partition, minimizing the weighted cross-entropy.
//! - **Validating**: every `max(1, train_size / batch_size)` steps, evaluate
//!   the full validation partition. A relative improvement above the
//!   tolerance checkpoints the model and resets patience; anything else
//!   consumes one unit of patience.
//! - **Converged**: patience exhausted. The last checkpoint is final.
//!
//! A non-finite loss aborts the run with [`Error::NumericalDivergence`].

mod early_stopping;

pub use early_stopping::{EarlyStopping, Verdict};

use crate::config::PipelineConfig;
use crate::fold::{write_json_atomic, Artifact, Fold, Workdir};
use crate::model::{Adam, Classifier, ModelCheckpoint, StandardScaler};
use crate::sample::TrainingSample;
use crate::tracking::{RunStatus, TrainingLog};
use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Training controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Events per mini-batch
    pub batch_size: usize,
    /// Validation checks without improvement before stopping
    pub patience: usize,
    /// Minimum relative improvement of the validation loss
    pub tolerance: f32,
    /// Fraction of the sample held out for validation
    pub validation_fraction: f64,
    /// Seed of the run's random generator
    pub seed: u64,
    /// Width of each hidden layer
    pub hidden_width: usize,
    /// Number of hidden layers
    pub hidden_layers: usize,
    /// Adam learning rate
    pub learning_rate: f32,
    /// Optional cap on optimizer steps
    pub max_steps: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            patience: 20,
            tolerance: 0.001,
            validation_fraction: 0.25,
            seed: 1234,
            hidden_width: 100,
            hidden_layers: 2,
            learning_rate: 0.001,
            max_steps: None,
        }
    }
}

impl TrainingConfig {
    /// Check value ranges
    ///
    /// # Errors
    /// Returns `InvalidInput` describing the first out-of-range setting
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be positive".to_string()));
        }
        if self.patience == 0 {
            return Err(Error::InvalidInput("patience must be positive".to_string()));
        }
        if !(self.tolerance >= 0.0 && self.tolerance.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "tolerance must be a non-negative number, got {}",
                self.tolerance
            )));
        }
        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return Err(Error::InvalidInput(format!(
                "validation_fraction must lie in (0, 1), got {}",
                self.validation_fraction
            )));
        }
        if self.hidden_width == 0 || self.hidden_layers == 0 {
            return Err(Error::InvalidInput(
                "hidden_width and hidden_layers must be positive".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.max_steps == Some(0) {
            return Err(Error::InvalidInput("max_steps must be positive".to_string()));
        }
        Ok(())
    }

    fn hidden(&self) -> Vec<usize> {
        vec![self.hidden_width; self.hidden_layers]
    }
}

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainState {
    /// Split, scaler fit and initialization
    Init,
    /// Mini-batch updates
    Training,
    /// Full validation-partition evaluation
    Validating,
    /// Patience exhausted
    Converged,
    /// Run finished; the best checkpoint is final
    Stopped,
}

/// Shuffled train/validation index split
///
/// The validation partition holds `ceil(n * fraction)` events.
///
/// # Errors
/// Returns `InvalidInput` if either partition would be empty
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn train_validation_split<R: Rng + ?Sized>(
    n: usize,
    validation_fraction: f64,
    rng: &mut R,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let n_val = (n as f64 * validation_fraction).ceil() as usize;
    if n_val == 0 || n_val >= n {
        return Err(Error::InvalidInput(format!(
            "Cannot split {n} events with validation fraction {validation_fraction}"
        )));
    }
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    let validation = indices.split_off(n - n_val);
    Ok((indices, validation))
}

/// Result of one training run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    /// Final run status
    pub status: RunStatus,
    /// Optimizer steps taken
    pub steps: u64,
    /// Validation checks performed
    pub validations: usize,
    /// Step of the best checkpoint
    pub best_step: u64,
    /// Validation loss of the best checkpoint
    pub best_val_loss: f32,
}

/// Trains and persists the model of one fold
#[derive(Debug)]
pub struct TrainingController<'a> {
    config: &'a TrainingConfig,
    workdir: &'a Workdir,
    fold: Fold,
    variables: Vec<String>,
    classes: Vec<String>,
    state: TrainState,
}

impl<'a> TrainingController<'a> {
    /// Controller for `fold`, writing artifacts under `workdir`
    #[must_use]
    pub const fn new(
        config: &'a TrainingConfig,
        workdir: &'a Workdir,
        fold: Fold,
        variables: Vec<String>,
        classes: Vec<String>,
    ) -> Self {
        Self {
            config,
            workdir,
            fold,
            variables,
            classes,
            state: TrainState::Init,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> TrainState {
        self.state
    }

    /// Train on `sample` until convergence (or the step cap)
    ///
    /// The training log is written whether the run succeeds or fails.
    ///
    /// # Errors
    /// Returns `NumericalDivergence` on a non-finite loss, `InvalidInput` if
    /// the sample cannot be split, or any IO error writing artifacts
    pub fn run(&mut self, sample: &TrainingSample, rng: &mut StdRng) -> Result<TrainingOutcome> {
        let mut log = TrainingLog::new(self.fold, self.config.seed);
        log.run_mut().start();
        let log_path = self.workdir.artifact(&Artifact::TrainingLog, self.fold);

        let result = self.train(sample, rng, &mut log);
        match &result {
            Ok(outcome) => log.run_mut().complete(outcome.status),
            Err(e) => {
                error!(fold = %self.fold, error = %e, "Training failed");
                log.run_mut().complete(RunStatus::Failed);
            }
        }
        log.save(&log_path)?;
        result
    }

    fn train(
        &mut self,
        sample: &TrainingSample,
        rng: &mut StdRng,
        log: &mut TrainingLog,
    ) -> Result<TrainingOutcome> {
        self.state = TrainState::Init;
        if sample.num_variables != self.variables.len() || sample.num_classes != self.classes.len()
        {
            return Err(Error::InvalidInput(format!(
                "Sample shape {}x{} does not match {} variables and {} classes",
                sample.num_variables,
                sample.num_classes,
                self.variables.len(),
                self.classes.len()
            )));
        }

        for artifact in [Artifact::Model, Artifact::Scaler] {
            if self.workdir.remove_artifact(&artifact, self.fold)? {
                debug!(fold = %self.fold, artifact = ?artifact, "Removed stale artifact");
            }
        }

        let (train_idx, val_idx) =
            train_validation_split(sample.num_events(), self.config.validation_fraction, rng)?;
        let mut train = sample.subset(&train_idx);
        let mut val = sample.subset(&val_idx);

        let scaler = StandardScaler::fit(&train.inputs, train.num_variables)?;
        scaler.transform(&mut train.inputs)?;
        scaler.transform(&mut val.inputs)?;
        let scaler_path = self.workdir.artifact(&Artifact::Scaler, self.fold);

        let mut classifier = Classifier::new(
            train.num_variables,
            &self.config.hidden(),
            train.num_classes,
            rng,
        )?;
        let mut optimizer = Adam::new(self.config.learning_rate, &classifier);
        let mut stopping = EarlyStopping::new(self.config.patience, self.config.tolerance);

        let n_train = train.num_events();
        let steps_per_validation = (n_train / self.config.batch_size).max(1) as u64;
        info!(
            fold = %self.fold,
            train_events = n_train,
            validation_events = val.num_events(),
            steps_per_validation,
            "Start training"
        );

        let model_path = self.workdir.artifact(&Artifact::Model, self.fold);
        let mut step = 0_u64;
        let mut validations = 0;
        let mut best: Option<(u64, f32)> = None;

        let status = loop {
            self.state = TrainState::Training;
            let batch: Vec<usize> = (0..self.config.batch_size)
                .map(|_| rng.gen_range(0..n_train))
                .collect();
            let batch = train.subset(&batch);
            let (train_loss, grads) =
                classifier.loss_and_gradients(&batch.inputs, &batch.targets, &batch.weights)?;
            step += 1;
            if !train_loss.is_finite() {
                return Err(Error::NumericalDivergence {
                    step,
                    loss: train_loss,
                });
            }
            optimizer.step(&mut classifier, &grads)?;

            let at_cap = self.config.max_steps.is_some_and(|cap| step >= cap);
            if step % steps_per_validation != 0 && !at_cap {
                continue;
            }

            self.state = TrainState::Validating;
            let val_loss = classifier.loss(&val.inputs, &val.targets, &val.weights)?;
            if !val_loss.is_finite() {
                return Err(Error::NumericalDivergence {
                    step,
                    loss: val_loss,
                });
            }
            validations += 1;
            let verdict = stopping.observe(val_loss);
            log.log_validation(step, train_loss, val_loss, stopping.remaining());
            info!(
                step,
                train_loss,
                val_loss,
                patience = stopping.remaining(),
                "Validation"
            );

            if verdict == Verdict::Improved {
                if best.is_none() {
                    write_json_atomic(&scaler_path, &scaler)?;
                    info!(path = %scaler_path.display(), "Wrote preprocessing");
                }
                ModelCheckpoint {
                    fold: self.fold,
                    step,
                    val_loss,
                    variables: self.variables.clone(),
                    classes: self.classes.clone(),
                    scaler: scaler.clone(),
                    classifier: classifier.clone(),
                }
                .save(&model_path)?;
                log.run_mut().record_best(step, val_loss);
                best = Some((step, val_loss));
                debug!(step, val_loss, path = %model_path.display(), "Saved checkpoint");
            }

            if verdict == Verdict::Converged {
                self.state = TrainState::Converged;
                info!(step, "Early stopping");
                break RunStatus::Converged;
            }
            if at_cap {
                info!(step, "Step limit reached");
                break RunStatus::StepLimit;
            }
        };
        self.state = TrainState::Stopped;

        let (best_step, best_val_loss) = best.ok_or_else(|| {
            Error::Other(format!("Fold {} finished without a checkpoint", self.fold))
        })?;
        info!(
            fold = %self.fold,
            best_step,
            best_val_loss,
            path = %model_path.display(),
            "Training finished"
        );
        Ok(TrainingOutcome {
            status,
            steps: step,
            validations,
            best_step,
            best_val_loss,
        })
    }
}

/// Train the model of one fold from its collected samples
///
/// # Errors
/// Returns `MissingInput` if a class sample is absent, plus every error of
/// [`TrainingController::run`]
pub fn train_fold(
    config: &PipelineConfig,
    workdir: &Workdir,
    fold: Fold,
) -> Result<TrainingOutcome> {
    let sample = TrainingSample::load(
        workdir,
        fold,
        &config.classes,
        &config.variables,
        &config.weight_column,
        config.use_class_weights,
    )?;
    let mut rng = StdRng::seed_from_u64(config.training.seed);
    let mut controller = TrainingController::new(
        &config.training,
        workdir,
        fold,
        config.variables.clone(),
        config.classes.clone(),
    );
    controller.run(&sample, &mut rng)
}
