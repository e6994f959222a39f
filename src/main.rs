//! xfold CLI
//!
//! # Usage
//!
//! ```bash
//! # Build the per-(class, fold) samples
//! xfold config.json workdir collect --nthreads 12
//!
//! # Train one model per fold
//! xfold config.json workdir train 0
//! xfold config.json workdir train 1
//!
//! # Score every source with the opposite-fold model
//! xfold config.json workdir apply
//! ```

use clap::Parser;
use std::process::ExitCode;
use trueno_xfold::cli::{run_command, Cli};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
