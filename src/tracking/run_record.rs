//! Run Record - lifecycle of one fold's training run

use crate::fold::Fold;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run is created but not yet started.
    Pending,
    /// Run is executing.
    Running,
    /// Early stopping triggered; the best checkpoint is final.
    Converged,
    /// Step cap reached before convergence; the best checkpoint is final.
    StepLimit,
    /// Run aborted with a fatal error.
    Failed,
}

/// Run Record represents a single training run of one fold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    fold: Fold,
    seed: u64,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    best_step: Option<u64>,
    best_val_loss: Option<f32>,
}

impl RunRecord {
    /// Create a new run record in Pending status.
    #[must_use]
    pub const fn new(fold: Fold, seed: u64) -> Self {
        Self {
            fold,
            seed,
            status: RunStatus::Pending,
            started_at: None,
            ended_at: None,
            best_step: None,
            best_val_loss: None,
        }
    }

    /// Fold this run trains on.
    #[must_use]
    pub const fn fold(&self) -> Fold {
        self.fold
    }

    /// Seed of the injected random generator.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Current run status.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Start timestamp, if the run has started.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// End timestamp, if the run has finished.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Step of the best checkpoint.
    #[must_use]
    pub const fn best_step(&self) -> Option<u64> {
        self.best_step
    }

    /// Validation loss of the best checkpoint.
    #[must_use]
    pub const fn best_val_loss(&self) -> Option<f32> {
        self.best_val_loss
    }

    /// Start the run, transitioning from Pending to Running.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Record a new best checkpoint.
    pub fn record_best(&mut self, step: u64, val_loss: f32) {
        self.best_step = Some(step);
        self.best_val_loss = Some(val_loss);
    }

    /// Finish the run with the given final status.
    pub fn complete(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_default() {
        let run = RunRecord::new(Fold::One, 7);
        assert_eq!(run.status(), RunStatus::Pending);
        assert_eq!(run.fold(), Fold::One);
        assert_eq!(run.seed(), 7);
        assert!(run.best_step().is_none());
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = RunRecord::new(Fold::Zero, 1234);
        run.start();
        assert_eq!(run.status(), RunStatus::Running);
        assert!(run.started_at().is_some());

        run.record_best(12, 0.7);
        run.complete(RunStatus::Converged);
        assert_eq!(run.status(), RunStatus::Converged);
        assert_eq!(run.best_step(), Some(12));
        assert!(run.ended_at() >= run.started_at());
    }
}
