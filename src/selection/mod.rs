//! Selection compiler
//!
//! A process is described by a list of named selections (channel, MC
//! corrections, signal definition, ...). Each contributes cut expressions
//! and weight expressions; both lists are always present, possibly empty.
//! Compiling the list yields one conjunctive cut and one multiplicative
//! weight:
//!
//! ```text
//! cuts    ["a>0", "b<5"]  ->  "(a>0)&&(b<5)"     (empty -> "true")
//! weights ["w1", "w2"]    ->  "(w1)*(w2)"        (empty -> "1")
//! ```
//!
//! Order is preserved so the compiled strings read like the definitions.

use crate::expr::Expression;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Compiled cut for an empty cut list
pub const TAUTOLOGY: &str = "true";

/// Compiled weight for an empty weight list
pub const IDENTITY_WEIGHT: &str = "1";

/// Named cut expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cut {
    /// Human-readable name
    pub name: String,
    /// Boolean expression
    pub expression: String,
}

/// Named weight expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weight {
    /// Human-readable name
    pub name: String,
    /// Numeric expression
    pub expression: String,
}

impl Cut {
    /// Create a named cut
    #[must_use]
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
        }
    }
}

impl Weight {
    /// Create a named weight
    #[must_use]
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
        }
    }
}

/// A named set of cuts and weights
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Selection name (e.g. `mt`, `mc`, `ggh`)
    pub name: String,
    /// Cuts, ANDed
    #[serde(default)]
    pub cuts: Vec<Cut>,
    /// Weights, multiplied
    #[serde(default)]
    pub weights: Vec<Weight>,
}

impl Selection {
    /// Create an empty selection
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a cut
    #[must_use]
    pub fn cut(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.cuts.push(Cut::new(name, expression));
        self
    }

    /// Add a weight
    #[must_use]
    pub fn weight(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.weights.push(Weight::new(name, expression));
        self
    }
}

/// Result of compiling a selection list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSelection {
    /// Conjunctive cut predicate
    pub cut: String,
    /// Multiplicative weight expression
    pub weight: String,
}

impl CompiledSelection {
    /// Parse both strings into evaluable expressions
    ///
    /// # Errors
    /// Returns `Expression` error if either string is invalid
    pub fn expressions(&self) -> Result<(Expression, Expression)> {
        Ok((Expression::parse(&self.cut)?, Expression::parse(&self.weight)?))
    }
}

/// Compile a selection list into `(cut, weight)` strings
#[must_use]
pub fn compile(selections: &[Selection]) -> CompiledSelection {
    let cuts: Vec<String> = selections
        .iter()
        .flat_map(|s| &s.cuts)
        .map(|c| format!("({})", c.expression))
        .collect();
    let weights: Vec<String> = selections
        .iter()
        .flat_map(|s| &s.weights)
        .map(|w| format!("({})", w.expression))
        .collect();

    CompiledSelection {
        cut: if cuts.is_empty() {
            TAUTOLOGY.to_string()
        } else {
            cuts.join("&&")
        },
        weight: if weights.is_empty() {
            IDENTITY_WEIGHT.to_string()
        } else {
            weights.join("*")
        },
    }
}
