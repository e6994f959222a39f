//! Training run tracking
//!
//! Each fold's training controller keeps one [`TrainingLog`]: a run record
//! describing the lifecycle of the run and a time-series of metrics sampled
//! at every validation check.
//!
//! ## Schema Overview
//!
//! ```text
//! TrainingLog (1 per fold)
//!     ├── RunRecord (status, timestamps, best checkpoint)
//!     └──< MetricRecord (N) [time-series: train_loss, val_loss, patience]
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use trueno_xfold::fold::Fold;
//! use trueno_xfold::tracking::{RunStatus, TrainingLog};
//!
//! let mut log = TrainingLog::new(Fold::Zero, 1234);
//! log.run_mut().start();
//! log.log_validation(0, 1.10, 1.08, 20);
//! log.run_mut().complete(RunStatus::Converged);
//!
//! assert_eq!(log.metrics("val_loss").len(), 1);
//! ```

mod log;
mod metric_record;
mod run_record;

pub use log::{TrainingLog, PATIENCE, TRAIN_LOSS, VAL_LOSS};
pub use metric_record::MetricRecord;
pub use run_record::{RunRecord, RunStatus};
