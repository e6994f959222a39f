//! Feature standardization (zero mean, unit variance per input variable)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Per-variable mean/variance transform, fit on a training partition only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Vec<f64>,
    var: Vec<f64>,
}

impl StandardScaler {
    /// Fit on a row-major matrix with `num_variables` columns
    ///
    /// # Errors
    /// Returns `InvalidInput` on an empty matrix or ragged length
    #[allow(clippy::cast_precision_loss)]
    pub fn fit(inputs: &[f32], num_variables: usize) -> Result<Self> {
        if num_variables == 0 || inputs.is_empty() || inputs.len() % num_variables != 0 {
            return Err(Error::InvalidInput(format!(
                "Cannot fit scaler on {} values with {num_variables} variables",
                inputs.len()
            )));
        }
        let rows = inputs.len() / num_variables;

        let mut mean = vec![0.0_f64; num_variables];
        for row in inputs.chunks_exact(num_variables) {
            for (m, &x) in mean.iter_mut().zip(row) {
                *m += f64::from(x);
            }
        }
        mean.iter_mut().for_each(|m| *m /= rows as f64);

        let mut var = vec![0.0_f64; num_variables];
        for row in inputs.chunks_exact(num_variables) {
            for ((v, &x), m) in var.iter_mut().zip(row).zip(&mean) {
                let d = f64::from(x) - m;
                *v += d * d;
            }
        }
        var.iter_mut().for_each(|v| *v /= rows as f64);

        Ok(Self { mean, var })
    }

    /// Number of variables the scaler was fit on
    #[must_use]
    pub fn num_variables(&self) -> usize {
        self.mean.len()
    }

    /// Per-variable means
    #[must_use]
    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Per-variable (population) variances
    #[must_use]
    pub fn var(&self) -> &[f64] {
        &self.var
    }

    /// Standardize a row-major matrix in place
    ///
    /// Constant variables (zero variance) are only centered.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the row width does not match
    #[allow(clippy::cast_possible_truncation)]
    pub fn transform(&self, inputs: &mut [f32]) -> Result<()> {
        let n = self.num_variables();
        if n == 0 || inputs.len() % n != 0 {
            return Err(Error::InvalidInput(format!(
                "Scaler expects rows of {n} variables, got {} values",
                inputs.len()
            )));
        }
        let scale: Vec<f64> = self
            .var
            .iter()
            .map(|&v| if v > 0.0 { v.sqrt() } else { 1.0 })
            .collect();
        for row in inputs.chunks_exact_mut(n) {
            for ((x, m), s) in row.iter_mut().zip(&self.mean).zip(&scale) {
                *x = ((f64::from(*x) - m) / s) as f32;
            }
        }
        Ok(())
    }
}
