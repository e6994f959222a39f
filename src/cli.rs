//! Command line for the three pipeline stages

use crate::config::PipelineConfig;
use crate::fold::{Fold, Workdir};
use crate::scan::ScanPool;
use crate::{inference, logging, sample, train};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

/// Fold-partitioned classifier training and cross-fold inference
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "xfold")]
#[command(version)]
pub struct Cli {
    /// Pipeline configuration (JSON)
    pub config: PathBuf,

    /// Working directory for samples, models and scores
    pub workdir: PathBuf,

    /// Stage to run
    #[command(subcommand)]
    pub command: Command,

    /// Default log level when `RUST_LOG` is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

/// Pipeline stages
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Build the per-(class, fold) training samples
    Collect {
        /// Scan worker threads (overrides the configuration)
        #[arg(long)]
        nthreads: Option<usize>,
    },

    /// Train the model of one fold
    Train {
        /// Fold to train on (0 or 1)
        #[arg(value_parser = clap::value_parser!(u64).range(0..=1))]
        fold: u64,
    },

    /// Score every configured source with the opposite-fold models
    Apply,
}

impl Command {
    /// Log file name of the stage
    #[must_use]
    pub fn log_stem(&self) -> String {
        match self {
            Self::Collect { .. } => "ml_dataset".to_string(),
            Self::Train { fold } => format!("ml_train_fold{fold}"),
            Self::Apply => "ml_apply".to_string(),
        }
    }
}

/// Run one stage
///
/// # Errors
/// Returns the stage error with context
pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.workdir)
        .with_context(|| format!("creating working directory {}", cli.workdir.display()))?;
    let workdir = Workdir::new(&cli.workdir);
    logging::init(&workdir.log_file(&cli.command.log_stem()), &cli.log_level)?;

    let mut config = PipelineConfig::from_json_file(&cli.config)
        .with_context(|| format!("loading configuration {}", cli.config.display()))?;

    match cli.command {
        Command::Collect { nthreads } => {
            if let Some(n) = nthreads {
                config.nthreads = n;
            }
            let pool = ScanPool::new(config.nthreads)?;
            info!(threads = pool.threads(), "Collect training samples");
            let summary = sample::collect_samples(&config, &workdir, &pool)?;
            for ((class, fold), events) in &summary {
                info!(class = %class, fold = %fold, events, "Sample written");
            }
        }
        Command::Train { fold } => {
            let fold = Fold::from_index(fold)?;
            let outcome = train::train_fold(&config, &workdir, fold)
                .with_context(|| format!("training fold {fold}"))?;
            info!(
                fold = %fold,
                status = ?outcome.status,
                steps = outcome.steps,
                best_step = outcome.best_step,
                best_val_loss = outcome.best_val_loss,
                "Done"
            );
        }
        Command::Apply => {
            let summary = inference::apply(&config, &workdir)?;
            info!(
                written = summary.written.len(),
                skipped = summary.skipped.len(),
                "Done"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_collect() {
        let cli = Cli::try_parse_from(["xfold", "c.json", "work", "collect", "--nthreads", "4"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("c.json"));
        assert_eq!(cli.workdir, PathBuf::from("work"));
        assert_eq!(cli.command, Command::Collect { nthreads: Some(4) });
        assert_eq!(cli.command.log_stem(), "ml_dataset");
    }

    #[test]
    fn test_parse_train() {
        let cli = Cli::try_parse_from(["xfold", "c.json", "work", "train", "1"]).unwrap();
        assert_eq!(cli.command, Command::Train { fold: 1 });
        assert_eq!(cli.command.log_stem(), "ml_train_fold1");
    }

    #[test]
    fn test_parse_train_rejects_bad_fold() {
        assert!(Cli::try_parse_from(["xfold", "c.json", "work", "train", "2"]).is_err());
    }

    #[test]
    fn test_parse_apply() {
        let cli = Cli::try_parse_from(["xfold", "c.json", "work", "apply"]).unwrap();
        assert_eq!(cli.command, Command::Apply);
        assert_eq!(cli.log_level, "info");
    }
}
