//! Pipeline configuration
//!
//! Loaded from a JSON file shared by all three stages (`collect`, `train`,
//! `apply`). Everything that is not a path or a list of names has a default.

use crate::sample::ProcessDefinition;
use crate::source::SourceLayout;
use crate::train::TrainingConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

fn default_event_key() -> String {
    "event".to_string()
}

fn default_weight_column() -> String {
    "training_weight".to_string()
}

fn default_nominal_variant() -> String {
    "mt_nominal".to_string()
}

const fn default_nthreads() -> usize {
    12
}

const fn default_true() -> bool {
    true
}

/// Full pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Base path of the primary event sources
    pub ntuples_base: PathBuf,
    /// Base paths of auxiliary column sources
    #[serde(default)]
    pub friends_base: Vec<PathBuf>,
    /// Event key column
    #[serde(default = "default_event_key")]
    pub event_key: String,
    /// Feature variables, in model input order
    pub variables: Vec<String>,
    /// Name of the derived weight column
    #[serde(default = "default_weight_column")]
    pub weight_column: String,
    /// Training classes, in label order
    pub classes: Vec<String>,
    /// Processes feeding the classes
    pub processes: Vec<ProcessDefinition>,
    /// Variant used to build training samples
    #[serde(default = "default_nominal_variant")]
    pub nominal_variant: String,
    /// Variants scored at inference (nominal plus systematic shifts)
    #[serde(default)]
    pub variants: Vec<String>,
    /// Source ids scored at inference
    #[serde(default)]
    pub apply_sources: Vec<String>,
    /// Worker threads for record scanning
    #[serde(default = "default_nthreads")]
    pub nthreads: usize,
    /// Rescale weights so every class contributes equally
    #[serde(default = "default_true")]
    pub use_class_weights: bool,
    /// Training controller settings
    #[serde(default)]
    pub training: TrainingConfig,
}

impl PipelineConfig {
    /// Read and validate a JSON configuration file
    ///
    /// # Errors
    /// Returns `MissingInput` if the file is absent, `Serialization` if it is
    /// malformed, `InvalidInput` if validation fails
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let config: Self = crate::fold::read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Source layout derived from the configured bases
    #[must_use]
    pub fn layout(&self) -> SourceLayout {
        SourceLayout {
            primary: self.ntuples_base.clone(),
            friends: self.friends_base.clone(),
            key: self.event_key.clone(),
        }
    }

    /// Variants scored at inference (the nominal variant when none are listed)
    #[must_use]
    pub fn apply_variants(&self) -> Vec<String> {
        if self.variants.is_empty() {
            vec![self.nominal_variant.clone()]
        } else {
            self.variants.clone()
        }
    }

    /// Check internal consistency
    ///
    /// # Errors
    /// Returns `InvalidInput` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.variables.is_empty() {
            return Err(Error::InvalidInput("No input variables configured".to_string()));
        }
        if self.classes.len() < 2 {
            return Err(Error::InvalidInput(format!(
                "At least two classes are required, got {}",
                self.classes.len()
            )));
        }
        let mut seen = HashSet::new();
        for class in &self.classes {
            if !seen.insert(class) {
                return Err(Error::InvalidInput(format!("Duplicate class {class}")));
            }
        }
        for process in &self.processes {
            if !seen.contains(&process.class) {
                return Err(Error::InvalidInput(format!(
                    "Process {} assigned to undeclared class {}",
                    process.name, process.class
                )));
            }
            if process.sources.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "Process {} has no sources",
                    process.name
                )));
            }
        }
        if self.variables.contains(&self.weight_column) {
            return Err(Error::InvalidInput(format!(
                "Weight column {} collides with an input variable",
                self.weight_column
            )));
        }
        self.training.validate()
    }
}
