//! Patience-based early stopping on the validation loss

/// Initial best loss; any finite first validation improves on it
const INITIAL_BEST: f32 = 1e9;

/// Outcome of one validation check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// New best loss; patience was reset
    Improved,
    /// No sufficient improvement; patience remains
    NoImprovement,
    /// Patience exhausted
    Converged,
}

/// Tracks the best validation loss and the remaining patience
///
/// A loss counts as an improvement only if it is lower than the best so far
/// by more than `tolerance`, relative to the best.
///
/// # Example
///
/// ```rust
/// use trueno_xfold::train::{EarlyStopping, Verdict};
///
/// let mut stopping = EarlyStopping::new(2, 0.001);
/// assert_eq!(stopping.observe(0.7), Verdict::Improved);
/// assert_eq!(stopping.observe(0.6999), Verdict::NoImprovement);
/// assert_eq!(stopping.observe(0.71), Verdict::Converged);
/// ```
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    patience: usize,
    tolerance: f32,
    remaining: usize,
    best: f32,
}

impl EarlyStopping {
    /// New tracker with full patience
    #[must_use]
    pub const fn new(patience: usize, tolerance: f32) -> Self {
        Self {
            patience,
            tolerance,
            remaining: patience,
            best: INITIAL_BEST,
        }
    }

    /// Best loss seen so far
    #[must_use]
    pub const fn best(&self) -> f32 {
        self.best
    }

    /// Remaining patience
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.remaining
    }

    /// Record one validation loss
    pub fn observe(&mut self, loss: f32) -> Verdict {
        if self.best > loss && (self.best - loss).abs() / self.best > self.tolerance {
            self.best = loss;
            self.remaining = self.patience;
            Verdict::Improved
        } else {
            self.remaining = self.remaining.saturating_sub(1);
            if self.remaining == 0 {
                Verdict::Converged
            } else {
                Verdict::NoImprovement
            }
        }
    }
}
