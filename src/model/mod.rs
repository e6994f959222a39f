//! Per-fold classifier: feature scaler, MLP and its persisted checkpoint
//!
//! A fold model is two artifacts written by one training run:
//!
//! - `preproc_fold<f>.json`: the [`StandardScaler`] fit on the training
//!   partition of fold `f`
//! - `model_fold<f>.json`: the best [`ModelCheckpoint`] of that run
//!
//! The checkpoint embeds the scaler it was trained behind; [`FoldModel`]
//! pairs the two artifacts read-only for inference and refuses a scaler
//! that does not match.

mod adam;
mod mlp;
mod scaler;

pub use adam::Adam;
pub use mlp::{softmax_rows, Classifier, Dense, Gradients};
pub use scaler::StandardScaler;

use crate::fold::{read_json, write_json_atomic, Artifact, Fold, Workdir};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Best classifier of one training run, with the metadata needed to apply it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    /// Fold the classifier was trained on
    pub fold: Fold,
    /// Optimizer step at which the checkpoint was taken
    pub step: u64,
    /// Validation loss at that step
    pub val_loss: f32,
    /// Input variables, in input order
    pub variables: Vec<String>,
    /// Class names, in output order
    pub classes: Vec<String>,
    /// Scaler the network's inputs were standardized with
    pub scaler: StandardScaler,
    /// Network parameters
    pub classifier: Classifier,
}

impl ModelCheckpoint {
    /// Write atomically
    ///
    /// # Errors
    /// Returns error on serialization or IO failure
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Read a checkpoint
    ///
    /// # Errors
    /// Returns `MissingInput` if absent, `Serialization` if malformed and
    /// `InvalidInput` if the network shape is inconsistent
    pub fn load(path: &Path) -> Result<Self> {
        let checkpoint: Self = read_json(path)?;
        checkpoint.classifier.validate().map_err(|e| {
            Error::InvalidInput(format!("{}: {e}", path.display()))
        })?;
        Ok(checkpoint)
    }
}

/// Scaler and checkpoint of one fold, loaded read-only
#[derive(Debug, Clone, PartialEq)]
pub struct FoldModel {
    scaler: StandardScaler,
    checkpoint: ModelCheckpoint,
}

impl FoldModel {
    /// Pair a scaler with a checkpoint
    ///
    /// # Errors
    /// Returns `InvalidInput` if their input widths differ or the scaler is
    /// not the one the checkpoint was trained behind
    pub fn new(scaler: StandardScaler, checkpoint: ModelCheckpoint) -> Result<Self> {
        let expected = checkpoint.classifier.num_variables();
        if scaler.num_variables() != expected || checkpoint.variables.len() != expected {
            return Err(Error::InvalidInput(format!(
                "Fold {} scaler has {} variables, model expects {expected}",
                checkpoint.fold,
                scaler.num_variables()
            )));
        }
        if scaler != checkpoint.scaler {
            return Err(Error::InvalidInput(format!(
                "Fold {} scaler was not produced by the run that wrote the model",
                checkpoint.fold
            )));
        }
        Ok(Self { scaler, checkpoint })
    }

    /// Load the artifacts of the model trained on `fold`
    ///
    /// # Errors
    /// Returns `MissingInput` if either artifact is absent
    pub fn load(workdir: &Workdir, fold: Fold) -> Result<Self> {
        let scaler_path = workdir.existing_artifact(&Artifact::Scaler, fold)?;
        let model_path = workdir.existing_artifact(&Artifact::Model, fold)?;
        let scaler: StandardScaler = read_json(&scaler_path)?;
        let checkpoint = ModelCheckpoint::load(&model_path)?;
        if checkpoint.fold != fold {
            return Err(Error::InvalidInput(format!(
                "{} holds a fold {} model",
                model_path.display(),
                checkpoint.fold
            )));
        }
        info!(
            fold = %fold,
            step = checkpoint.step,
            val_loss = checkpoint.val_loss,
            path = %model_path.display(),
            "Loaded model"
        );
        Self::new(scaler, checkpoint)
    }

    /// Fold the model was trained on
    #[must_use]
    pub const fn fold(&self) -> Fold {
        self.checkpoint.fold
    }

    /// Input variables
    #[must_use]
    pub fn variables(&self) -> &[String] {
        &self.checkpoint.variables
    }

    /// Class names
    #[must_use]
    pub fn classes(&self) -> &[String] {
        &self.checkpoint.classes
    }

    /// Scaler
    #[must_use]
    pub const fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }

    /// Checkpoint
    #[must_use]
    pub const fn checkpoint(&self) -> &ModelCheckpoint {
        &self.checkpoint
    }

    /// Class probabilities of unscaled, row-major inputs
    ///
    /// # Errors
    /// Returns `InvalidInput` if the row width does not match
    pub fn predict_proba(&self, inputs: &[f32]) -> Result<Vec<f32>> {
        let mut scaled = inputs.to_vec();
        self.scaler.transform(&mut scaled)?;
        self.checkpoint.classifier.predict_proba(&scaled)
    }
}
