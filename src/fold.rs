//! Fold assignment and per-fold artifact addressing
//!
//! Events are split into two disjoint folds by `event mod 2`. Every artifact
//! the pipeline persists for a fold (sample, scaler, model, training log)
//! is addressed through [`Workdir::artifact`], which is the only place the
//! `<name>_fold<f>.<ext>` naming convention is spelled out.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Binary event partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Fold {
    /// Events with an even identifier
    Zero,
    /// Events with an odd identifier
    One,
}

impl Fold {
    /// Both folds in index order
    pub const ALL: [Self; 2] = [Self::Zero, Self::One];

    /// Fold of an event identifier (`event mod 2`)
    #[must_use]
    pub const fn of_event(event: u64) -> Self {
        if event % 2 == 0 {
            Self::Zero
        } else {
            Self::One
        }
    }

    /// The complementary fold
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }

    /// Numeric fold id (0 or 1)
    #[must_use]
    pub const fn index(self) -> u64 {
        match self {
            Self::Zero => 0,
            Self::One => 1,
        }
    }

    /// Parse a numeric fold id
    ///
    /// # Errors
    /// Returns error for anything other than 0 or 1
    pub fn from_index(index: u64) -> Result<Self> {
        match index {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            other => Err(Error::InvalidInput(format!(
                "Fold must be 0 or 1, got {other}"
            ))),
        }
    }
}

impl fmt::Display for Fold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Count events per fold
///
/// Returns `(fold0, fold1)`.
#[must_use]
pub fn fold_counts(events: &[u64]) -> (usize, usize) {
    let fold0 = events
        .iter()
        .filter(|&&e| Fold::of_event(e) == Fold::Zero)
        .count();
    (fold0, events.len() - fold0)
}

/// Kind of per-fold artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Artifact {
    /// Materialized training sample for one class group
    Sample(String),
    /// Feature-scaling parameters
    Scaler,
    /// Best model checkpoint
    Model,
    /// Training log (run record and loss curves)
    TrainingLog,
}

impl Artifact {
    fn stem(&self) -> &str {
        match self {
            Self::Sample(class) => class,
            Self::Scaler => "preproc",
            Self::Model => "model",
            Self::TrainingLog => "training_log",
        }
    }

    const fn extension(&self) -> &'static str {
        match self {
            Self::Sample(_) => "parquet",
            Self::Scaler | Self::Model | Self::TrainingLog => "json",
        }
    }

    /// File name for this artifact in the given fold
    #[must_use]
    pub fn file_name(&self, fold: Fold) -> String {
        format!("{}_fold{}.{}", self.stem(), fold, self.extension())
    }
}

/// Working directory holding every per-fold artifact and the score output
#[derive(Debug, Clone)]
pub struct Workdir {
    root: PathBuf,
}

impl Workdir {
    /// Wrap a working directory root
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root path
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a per-fold artifact
    #[must_use]
    pub fn artifact(&self, artifact: &Artifact, fold: Fold) -> PathBuf {
        self.root.join(artifact.file_name(fold))
    }

    /// Path of a per-fold artifact, failing if it does not exist yet
    ///
    /// # Errors
    /// Returns `MissingInput` when the artifact has not been produced
    pub fn existing_artifact(&self, artifact: &Artifact, fold: Fold) -> Result<PathBuf> {
        let path = self.artifact(artifact, fold);
        if path.exists() {
            Ok(path)
        } else {
            Err(Error::MissingInput(format!(
                "Artifact {} does not exist",
                path.display()
            )))
        }
    }

    /// Delete a per-fold artifact left by an earlier run
    ///
    /// Returns whether a file was removed.
    ///
    /// # Errors
    /// Returns error if the artifact exists but cannot be removed
    pub fn remove_artifact(&self, artifact: &Artifact, fold: Fold) -> Result<bool> {
        let path = self.artifact(artifact, fold);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Directory holding the score output of one source
    #[must_use]
    pub fn scores_dir(&self, source_id: &str) -> PathBuf {
        self.root.join("MLScores").join(source_id)
    }

    /// Log file of a pipeline stage
    #[must_use]
    pub fn log_file(&self, stage: &str) -> PathBuf {
        self.root.join(format!("{stage}.log"))
    }
}

/// Temporary sibling path used while an artifact is being written
#[must_use]
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write bytes to `path` atomically (write to a sibling, then rename)
///
/// # Errors
/// Returns error if the temporary file cannot be written or renamed
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = staging_path(path);
    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        fs::remove_file(&tmp).ok();
    }
    result
}

/// Serialize `value` as pretty JSON and write it atomically
///
/// # Errors
/// Returns error on serialization or IO failure
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Read a JSON artifact
///
/// # Errors
/// Returns `MissingInput` if the file is absent, `Serialization` if malformed
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(Error::MissingInput(format!(
            "File {} does not exist",
            path.display()
        )));
    }
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
