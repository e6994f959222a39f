//! # Trueno-XFold: Fold-Partitioned Training and Cross-Fold Inference
//!
//! **Version**: 0.1.0
//!
//! Trueno-XFold assembles labeled, weighted training samples from columnar
//! event stores, trains one classifier per event fold, and scores the full
//! dataset so that no model ever sees an event it was trained on.
//!
//! ## Pipeline
//!
//! ```text
//! sources --merge--> records --cut/weight--> samples --train--> models
//!                                                                  |
//! sources --merge--> records ------------------- cross-apply <-----+--> scores
//! ```
//!
//! - **Folds**: `event mod 2`; every event belongs to exactly one fold
//! - **Class weights**: each class rescaled to the unnormalized total weight
//! - **Early stopping**: relative tolerance plus patience on validation loss
//! - **Cross-apply**: fold-0 events are scored by the fold-1 model and vice versa
//!
//! ## Example Usage
//!
//! ```rust
//! use trueno_xfold::fold::Fold;
//! use trueno_xfold::selection::{compile, Selection};
//!
//! let selections = vec![
//!     Selection::new("mt").cut("os", "q_1*q_2<0"),
//!     Selection::new("mc").weight("pu", "puweight"),
//! ];
//! let compiled = compile(&selections);
//! assert_eq!(compiled.cut, "(q_1*q_2<0)");
//! assert_eq!(compiled.weight, "(puweight)");
//!
//! assert_eq!(Fold::of_event(7), Fold::One);
//! assert_eq!(Fold::of_event(7).opposite(), Fold::Zero);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cli;
pub mod config;
pub mod error;
pub mod expr;
pub mod fold;
pub mod inference;
pub mod logging;
pub mod model;
pub mod sample;
pub mod scan;
pub mod selection;
pub mod source;
pub mod storage;
pub mod tracking;
pub mod train;

pub use error::{Error, Result};
