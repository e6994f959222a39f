//! Adam optimizer with bias correction

use super::mlp::{Classifier, Gradients};
use crate::{Error, Result};

/// Adam state for one classifier
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl Adam {
    /// Optimizer with the usual defaults (`beta1 = 0.9`, `beta2 = 0.999`, `eps = 1e-8`)
    #[must_use]
    pub fn new(lr: f32, model: &Classifier) -> Self {
        let sizes = model.parameter_sizes();
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step: 0,
            m: sizes.iter().map(|&n| vec![0.0; n]).collect(),
            v: sizes.iter().map(|&n| vec![0.0; n]).collect(),
        }
    }

    /// Learning rate
    #[must_use]
    pub const fn lr(&self) -> f32 {
        self.lr
    }

    /// Number of updates applied
    #[must_use]
    pub const fn steps(&self) -> i32 {
        self.step
    }

    /// Apply one update
    ///
    /// # Errors
    /// Returns `InvalidInput` if the gradients do not match the model
    pub fn step(&mut self, model: &mut Classifier, grads: &Gradients) -> Result<()> {
        let flat: Vec<&Vec<f32>> = grads.layers.iter().flat_map(|(w, b)| [w, b]).collect();
        if flat.len() != self.m.len() || flat.iter().zip(&self.m).any(|(g, m)| g.len() != m.len())
        {
            return Err(Error::InvalidInput(
                "Gradient shapes do not match the model".to_string(),
            ));
        }

        self.step += 1;
        let bc1 = 1.0 - self.beta1.powi(self.step);
        let bc2 = 1.0 - self.beta2.powi(self.step);

        for (((param, grad), m), v) in model
            .parameters_mut()
            .zip(flat)
            .zip(&mut self.m)
            .zip(&mut self.v)
        {
            for (((p, &g), m), v) in param.iter_mut().zip(grad).zip(m).zip(v) {
                *m = self.beta1.mul_add(*m, (1.0 - self.beta1) * g);
                *v = self.beta2.mul_add(*v, (1.0 - self.beta2) * g * g);
                let m_hat = *m / bc1;
                let v_hat = *v / bc2;
                *p -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn data() -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        // Two separable blobs on the first input
        let x = vec![-2.0, 0.1, -1.5, -0.2, 1.7, 0.3, 2.2, -0.1];
        let y = vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0];
        let w = vec![1.0; 4];
        (x, y, w)
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        let mut model = Classifier::new(2, &[3], 2, &mut StdRng::seed_from_u64(1)).unwrap();
        let before = model.clone();
        let (x, y, w) = data();
        let (_, grads) = model.loss_and_gradients(&x, &y, &w).unwrap();
        let mut adam = Adam::new(0.01, &model);
        adam.step(&mut model, &grads).unwrap();
        assert_eq!(adam.steps(), 1);

        // Bias-corrected first step moves each parameter by at most lr
        let mut after = model;
        let mut reference = before;
        let moved: Vec<Vec<f32>> = after.parameters_mut().map(|p| p.clone()).collect();
        let original: Vec<Vec<f32>> = reference.parameters_mut().map(|p| p.clone()).collect();
        for (a, b) in moved.iter().zip(&original) {
            for (pa, pb) in a.iter().zip(b) {
                assert!((pa - pb).abs() <= 0.01 + 1e-6);
            }
        }
        assert_ne!(moved, original);
    }

    #[test]
    fn test_reduces_loss() {
        let mut model = Classifier::new(2, &[8], 2, &mut StdRng::seed_from_u64(2)).unwrap();
        let (x, y, w) = data();
        let initial = model.loss(&x, &y, &w).unwrap();
        let mut adam = Adam::new(0.01, &model);
        for _ in 0..200 {
            let (_, grads) = model.loss_and_gradients(&x, &y, &w).unwrap();
            adam.step(&mut model, &grads).unwrap();
        }
        let trained = model.loss(&x, &y, &w).unwrap();
        assert!(trained < initial * 0.5, "{trained} vs {initial}");
    }

    #[test]
    fn test_rejects_mismatched_gradients() {
        let mut model = Classifier::new(2, &[3], 2, &mut StdRng::seed_from_u64(1)).unwrap();
        let mut adam = Adam::new(0.01, &model);
        let grads = Gradients { layers: vec![] };
        assert!(adam.step(&mut model, &grads).is_err());
    }
}
