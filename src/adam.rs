//! Adam updates for layout coordinates.
//!
//! The bundled [`PairwiseEngine`](crate::PairwiseEngine) moves its layout with
//! adaptive moment estimation. Per-coordinate learning rates keep points in
//! dense and sparse regions moving at comparable speeds.

use ndarray::{Array2, ArrayView2, ArrayViewMut2, Zip};

/// First and second moment estimates for one layout.
#[derive(Debug, Clone)]
pub struct AdamState {
    /// Gradient moving average
    m: Array2<f32>,
    /// Squared gradient moving average
    v: Array2<f32>,
    beta1: f32,
    beta2: f32,
    /// Updates applied so far
    steps: i32,
}

impl AdamState {
    /// Creates zeroed moments for a `(points, dimensions)` layout.
    pub fn new(shape: (usize, usize)) -> Self {
        Self {
            m: Array2::zeros(shape),
            v: Array2::zeros(shape),
            beta1: 0.9,
            beta2: 0.999,
            steps: 0,
        }
    }

    /// Forgets accumulated momentum, e.g. after the layout was perturbed.
    pub fn reset(&mut self) {
        self.m.fill(0.0);
        self.v.fill(0.0);
        self.steps = 0;
    }

    /// Applies one bias-corrected Adam step to `y`.
    ///
    /// # Panics
    /// * If `y`, `grad` and the moments differ in shape
    pub fn update(&mut self, y: ArrayViewMut2<f32>, grad: ArrayView2<f32>, lr: f32) {
        self.steps = self.steps.saturating_add(1);
        let (beta1, beta2) = (self.beta1, self.beta2);
        let lr_t = lr * (1.0 - beta2.powi(self.steps)).sqrt() / (1.0 - beta1.powi(self.steps));

        Zip::from(y)
            .and(grad)
            .and(&mut self.m)
            .and(&mut self.v)
            .par_for_each(|y, &grad, m, v| {
                *m += (1.0 - beta1) * (grad - *m);
                *v += (1.0 - beta2) * (grad.powi(2) - *v);
                *y -= lr_t * *m / (v.sqrt() + 1e-7);
            });
    }
}
