//! Multi-layer perceptron classifier
//!
//! `inputs -> [dense + tanh] x hidden -> dense -> softmax`
//!
//! Matrices are row-major `Vec<f32>`; a dense layer stores its weights as
//! `inputs x outputs`. The loss is the weighted multi-class cross-entropy
//!
//! ```text
//! L = sum_i w_i * CE(y_i, softmax(z_i)) / n
//! ```
//!
//! averaged over rows, so zero-weight events only dilute a batch. Matrix
//! products go through `trueno::blis::gemm`.

use crate::{Error, Result};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Rows per parallel inference task
const PREDICT_CHUNK_ROWS: usize = 4096;

/// Fully connected layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    inputs: usize,
    outputs: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl Dense {
    /// Glorot-uniform weights, zero bias
    #[allow(clippy::cast_precision_loss)]
    fn init<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (inputs + outputs) as f32).sqrt();
        let weights = (0..inputs * outputs)
            .map(|_| rng.gen_range(-limit..limit))
            .collect();
        Self {
            inputs,
            outputs,
            weights,
            bias: vec![0.0; outputs],
        }
    }

    /// `x . W + b` for `rows` rows
    fn forward(&self, x: &[f32], rows: usize) -> Vec<f32> {
        let mut out = matmul(x, &self.weights, rows, self.inputs, self.outputs);
        for row in out.chunks_exact_mut(self.outputs) {
            for (o, &b) in row.iter_mut().zip(&self.bias) {
                *o += b;
            }
        }
        out
    }
}

/// Row-major `a (m x k) . b (k x n)`
fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut c = vec![0.0_f32; m * n];
    if m == 0 || n == 0 || k == 0 {
        return c;
    }
    if let Err(e) = trueno::blis::gemm(m, n, k, a, b, &mut c) {
        warn!(error = ?e, m, k, n, "trueno gemm failed, using naive");
        c.fill(0.0);
        for (ar, cr) in a.chunks_exact(k).zip(c.chunks_exact_mut(n)) {
            for (&av, br) in ar.iter().zip(b.chunks_exact(n)) {
                for (cv, &bv) in cr.iter_mut().zip(br) {
                    *cv += av * bv;
                }
            }
        }
    }
    c
}

/// Row-major transpose of a `rows x cols` matrix
fn transpose(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0_f32; rows * cols];
    for (i, row) in data.chunks_exact(cols).enumerate() {
        for (j, &v) in row.iter().enumerate() {
            out[j * rows + i] = v;
        }
    }
    out
}

/// Gradients of every layer, in layer order
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    /// `(d weights, d bias)` per layer
    pub layers: Vec<(Vec<f32>, Vec<f32>)>,
}

/// Softmax classifier with tanh hidden layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classifier {
    layers: Vec<Dense>,
}

impl Classifier {
    /// Initialize a network
    ///
    /// # Errors
    /// Returns `InvalidInput` for zero-sized layers or fewer than two classes
    pub fn new<R: Rng + ?Sized>(
        num_variables: usize,
        hidden: &[usize],
        num_classes: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if num_variables == 0 || num_classes < 2 || hidden.contains(&0) {
            return Err(Error::InvalidInput(format!(
                "Invalid network shape: {num_variables} -> {hidden:?} -> {num_classes}"
            )));
        }
        let mut widths = Vec::with_capacity(hidden.len() + 2);
        widths.push(num_variables);
        widths.extend_from_slice(hidden);
        widths.push(num_classes);

        let layers = widths
            .windows(2)
            .map(|w| Dense::init(w[0], w[1], rng))
            .collect();
        Ok(Self { layers })
    }

    /// Check layer shapes of a deserialized network
    ///
    /// # Errors
    /// Returns `InvalidInput` if there are no layers, a layer's buffers do
    /// not match its shape, consecutive layers do not chain, or the output
    /// has fewer than two classes
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(Error::InvalidInput("Network has no layers".to_string()));
        }
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.inputs == 0
                || layer.outputs == 0
                || layer.weights.len() != layer.inputs * layer.outputs
                || layer.bias.len() != layer.outputs
            {
                return Err(Error::InvalidInput(format!(
                    "Layer {i} is malformed: {}x{} with {} weights and {} biases",
                    layer.inputs,
                    layer.outputs,
                    layer.weights.len(),
                    layer.bias.len()
                )));
            }
        }
        if let Some(i) = self
            .layers
            .windows(2)
            .position(|w| w[0].outputs != w[1].inputs)
        {
            return Err(Error::InvalidInput(format!(
                "Layer {} outputs do not feed layer {}",
                i,
                i + 1
            )));
        }
        if self.num_classes() < 2 {
            return Err(Error::InvalidInput(format!(
                "Network has {} output classes",
                self.num_classes()
            )));
        }
        Ok(())
    }

    /// Input width
    #[must_use]
    pub fn num_variables(&self) -> usize {
        self.layers.first().map_or(0, |l| l.inputs)
    }

    /// Output width
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.layers.last().map_or(0, |l| l.outputs)
    }

    /// Parameter buffers in optimizer order (`w0, b0, w1, b1, ...`)
    pub(crate) fn parameters_mut(&mut self) -> impl Iterator<Item = &mut Vec<f32>> {
        self.layers
            .iter_mut()
            .flat_map(|l| [&mut l.weights, &mut l.bias])
    }

    /// Parameter sizes in optimizer order
    #[must_use]
    pub fn parameter_sizes(&self) -> Vec<usize> {
        self.layers
            .iter()
            .flat_map(|l| [l.weights.len(), l.bias.len()])
            .collect()
    }

    fn check_rows(&self, x: &[f32]) -> Result<usize> {
        let n = self.num_variables();
        if n == 0 || x.len() % n != 0 {
            return Err(Error::InvalidInput(format!(
                "Expected rows of {n} inputs, got {} values",
                x.len()
            )));
        }
        Ok(x.len() / n)
    }

    /// Activations of every layer: input, hidden outputs, logits
    fn activations(&self, x: &[f32], rows: usize) -> Vec<Vec<f32>> {
        let mut acts = Vec::with_capacity(self.layers.len() + 1);
        acts.push(x.to_vec());
        let last = self.layers.len().saturating_sub(1);
        for (i, layer) in self.layers.iter().enumerate() {
            let mut z = layer.forward(&acts[i], rows);
            if i < last {
                z.iter_mut().for_each(|v| *v = v.tanh());
            }
            acts.push(z);
        }
        acts
    }

    /// Class probabilities, row-major `rows x num_classes`
    ///
    /// # Errors
    /// Returns `InvalidInput` if the row width does not match
    pub fn predict_proba(&self, x: &[f32]) -> Result<Vec<f32>> {
        self.check_rows(x)?;
        let width = self.num_variables();
        let chunks: Vec<Vec<f32>> = x
            .par_chunks(PREDICT_CHUNK_ROWS * width)
            .map(|chunk| {
                let rows = chunk.len() / width;
                let mut logits = self.activations(chunk, rows).pop().unwrap_or_default();
                softmax_rows(&mut logits, self.num_classes());
                logits
            })
            .collect();
        Ok(chunks.concat())
    }

    /// Weighted cross-entropy loss without gradients
    ///
    /// # Errors
    /// Returns `InvalidInput` on shape mismatch
    pub fn loss(&self, x: &[f32], targets: &[f32], weights: &[f32]) -> Result<f32> {
        let rows = self.check_rows(x)?;
        self.check_targets(rows, targets, weights)?;
        let logits = self.activations(x, rows).pop().unwrap_or_default();
        Ok(weighted_cross_entropy(&logits, targets, weights, self.num_classes()).0)
    }

    /// Weighted cross-entropy loss and its gradients
    ///
    /// # Errors
    /// Returns `InvalidInput` on shape mismatch
    pub fn loss_and_gradients(
        &self,
        x: &[f32],
        targets: &[f32],
        weights: &[f32],
    ) -> Result<(f32, Gradients)> {
        let rows = self.check_rows(x)?;
        self.check_targets(rows, targets, weights)?;
        let acts = self.activations(x, rows);
        let k = self.num_classes();
        let (loss, mut delta) =
            weighted_cross_entropy(&acts[acts.len() - 1], targets, weights, k);

        let mut grads = Vec::with_capacity(self.layers.len());
        for (l, layer) in self.layers.iter().enumerate().rev() {
            let a = &acts[l];
            let dw = matmul(
                &transpose(a, rows, layer.inputs),
                &delta,
                layer.inputs,
                rows,
                layer.outputs,
            );
            let mut db = vec![0.0_f32; layer.outputs];
            for dr in delta.chunks_exact(layer.outputs) {
                for (b, &d) in db.iter_mut().zip(dr) {
                    *b += d;
                }
            }

            if l > 0 {
                // delta . W^T through the tanh of the previous layer
                let mut prev = matmul(
                    &delta,
                    &transpose(&layer.weights, layer.inputs, layer.outputs),
                    rows,
                    layer.outputs,
                    layer.inputs,
                );
                for (p, &av) in prev.iter_mut().zip(a) {
                    *p *= 1.0 - av * av;
                }
                delta = prev;
            }
            grads.push((dw, db));
        }
        grads.reverse();
        Ok((loss, Gradients { layers: grads }))
    }

    fn check_targets(&self, rows: usize, targets: &[f32], weights: &[f32]) -> Result<()> {
        if targets.len() != rows * self.num_classes() || weights.len() != rows {
            return Err(Error::InvalidInput(format!(
                "Shape mismatch: {rows} rows, {} targets, {} weights",
                targets.len(),
                weights.len()
            )));
        }
        Ok(())
    }
}

/// Numerically stable row-wise softmax in place
pub fn softmax_rows(logits: &mut [f32], width: usize) {
    for row in logits.chunks_exact_mut(width) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        row.iter_mut().for_each(|v| *v /= sum);
    }
}

/// Row-averaged weighted cross-entropy and its gradient with respect to
/// the logits
#[allow(clippy::cast_precision_loss)]
fn weighted_cross_entropy(
    logits: &[f32],
    targets: &[f32],
    weights: &[f32],
    width: usize,
) -> (f32, Vec<f32>) {
    let rows = weights.len().max(1) as f32;
    let mut loss = 0.0_f64;
    let mut grad = vec![0.0_f32; logits.len()];

    for (((zr, yr), &w), gr) in logits
        .chunks_exact(width)
        .zip(targets.chunks_exact(width))
        .zip(weights)
        .zip(grad.chunks_exact_mut(width))
    {
        let max = zr.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let lse = zr.iter().map(|z| (z - max).exp()).sum::<f32>().ln() + max;
        let y_sum: f32 = yr.iter().sum();
        let mut ce = 0.0_f32;
        for ((&z, &y), g) in zr.iter().zip(yr).zip(gr.iter_mut()) {
            ce -= y * (z - lse);
            let p = (z - lse).exp();
            *g = w * (p * y_sum - y) / rows;
        }
        loss += f64::from(w * ce);
    }

    #[allow(clippy::cast_possible_truncation)]
    let loss = (loss / f64::from(rows)) as f32;
    (loss, grad)
}
