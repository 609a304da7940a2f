use crate::layers::Param;
use crate::model::Module;

use ndarray::prelude::*;

/// Per-example softmax cross-entropy of raw logits against (soft) labels.
///
/// Uses the log-sum-exp form so large logits do not overflow.
pub fn cross_entropy(logits: &Array2<f32>, labels: &Array2<f32>) -> Array1<f32> {
    let max = logits.fold_axis(Axis(1), f32::NEG_INFINITY, |&a, &b| a.max(b));
    let shifted = logits - &max.insert_axis(Axis(1));
    let log_sum = shifted.mapv(f32::exp).sum_axis(Axis(1)).mapv(f32::ln);
    let log_probs = shifted - &log_sum.insert_axis(Axis(1));
    -(labels * &log_probs).sum_axis(Axis(1))
}

/// Gradient of `sum(cross_entropy) / normalizer` with respect to the logits.
///
/// For label rows that do not sum to one the softmax term is scaled by the
/// row sum, which is the exact derivative for soft or unlabeled (-1) rows.
pub fn cross_entropy_grad(logits: &Array2<f32>, labels: &Array2<f32>, normalizer: f32) -> Array2<f32> {
    let probs = crate::layers::softmax(logits);
    let label_mass = labels.sum_axis(Axis(1)).insert_axis(Axis(1));
    (probs * &label_mass - labels) / normalizer
}

/// Normalized batch loss and its gradient with respect to the logits.
///
/// loss = sum_i CE(softmax(logits_i), labels_i) / normalizer
pub fn normalized_cross_entropy(
    logits: &Array2<f32>,
    labels: &Array2<f32>,
    normalizer: f32,
) -> (f32, Array2<f32>) {
    let loss = cross_entropy(logits, labels).sum() / normalizer;
    (loss, cross_entropy_grad(logits, labels, normalizer))
}

pub trait Optimizer {
    /// Run one optimization step.
    /// Note:
    /// - Assumes forward+backward pass have been done.
    /// - May mutate the optimizer internal state (e.g. moments).
    fn step(&mut self, model: &mut dyn Module);
}

/// Adam with a constant learning rate.
pub struct Adam {
    pub t: i32,
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    // (m, v) per parameter, in `Module::params` order
    states: Vec<(ArrayD<f32>, ArrayD<f32>)>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Adam {
            t: 0,
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            states: Vec::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, model: &mut dyn Module) {
        self.t += 1;
        let t_f32 = self.t as f32;

        let params = model.params();
        if self.states.is_empty() {
            self.states = params
                .iter()
                .map(|p| (ArrayD::zeros(p.value.raw_dim()), ArrayD::zeros(p.value.raw_dim())))
                .collect();
        }
        assert_eq!(self.states.len(), params.len(), "model parameters changed between steps");

        for (param, state) in params.into_iter().zip(self.states.iter_mut()) {
            let Param { mut value, grad, .. } = param;
            if let Some(grad) = grad {
                update_param(
                    &mut value,
                    &grad,
                    state,
                    self.learning_rate,
                    self.beta1,
                    self.beta2,
                    self.epsilon,
                    t_f32,
                );
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn update_param(
    param: &mut ArrayViewMutD<f32>,
    grad: &ArrayViewD<f32>,
    state: &mut (ArrayD<f32>, ArrayD<f32>),
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: f32,
) {
    let (m, v) = state;

    // m = beta1 * m + (1 - beta1) * grad
    m.zip_mut_with(grad, |m_val, g_val| {
        *m_val = beta1 * *m_val + (1.0 - beta1) * g_val;
    });

    // v = beta2 * v + (1 - beta2) * grad^2
    v.zip_mut_with(grad, |v_val, g_val| {
        *v_val = beta2 * *v_val + (1.0 - beta2) * g_val.powi(2);
    });

    // Bias correction
    let m_corr = 1.0 - beta1.powf(t);
    let v_corr = 1.0 - beta2.powf(t);

    // Update weight: w = w - lr * (m / m_corr) / (sqrt(v / v_corr) + eps)
    azip!((p in param, mv in &*m, vv in &*v) {
        let m_hat = mv / m_corr;
        let v_hat = vv / v_corr;
        *p -= lr * m_hat / (v_hat.sqrt() + eps);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::FcLayer;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn loss_is_summed_and_normalized() {
        let logits = array![[2.0f32, 1.0, 0.1], [0.5, 2.5, -1.0]];
        let labels = array![[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let (batch_size, image_dim) = (2.0f32, 28.0f32);
        let normalizer = batch_size * image_dim * image_dim;

        let per_example: Vec<f32> = logits
            .rows()
            .into_iter()
            .zip(labels.rows())
            .map(|(z, y)| {
                let exps: Vec<f32> = z.iter().map(|v| v.exp()).collect();
                let total: f32 = exps.iter().sum();
                let class = y.iter().position(|&l| l == 1.0).unwrap();
                -(exps[class] / total).ln()
            })
            .collect();
        let expected = per_example.iter().sum::<f32>() / normalizer;

        let (loss, _) = normalized_cross_entropy(&logits, &labels, normalizer);
        assert!((loss - expected).abs() < 1e-7, "{loss} vs {expected}");
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let logits = array![[0.3f32, -1.2, 2.0], [1.0, 0.0, -0.5]];
        let labels = array![[0.0f32, 0.0, 1.0], [1.0, 0.0, 0.0]];
        let normalizer = 4.0;
        let (_, grad) = normalized_cross_entropy(&logits, &labels, normalizer);

        let eps = 1e-3;
        for ((i, j), &g) in grad.indexed_iter() {
            let mut plus = logits.clone();
            plus[(i, j)] += eps;
            let mut minus = logits.clone();
            minus[(i, j)] -= eps;
            let numeric = (normalized_cross_entropy(&plus, &labels, normalizer).0
                - normalized_cross_entropy(&minus, &labels, normalizer).0)
                / (2.0 * eps);
            assert!((numeric - g).abs() < 1e-3, "({i},{j}) numeric {numeric} vs {g}");
        }
    }

    #[test]
    fn large_logits_stay_finite() {
        let logits = array![[1000.0f32, 0.0]];
        let labels = array![[0.0f32, 1.0]];
        let ce = cross_entropy(&logits, &labels);
        assert!((ce[0] - 1000.0).abs() < 1e-3);
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut fc = FcLayer::new(1, 1, &mut rng);
        fc.weights.fill(1.0);
        fc.forward(array![[1.0f32]].into_dyn());
        fc.backward(array![[0.5f32]].into_dyn());

        let mut adam = Adam::new(0.01);
        adam.step(&mut fc);
        // first bias-corrected step is lr * sign(grad)
        assert!((fc.weights[(0, 0)] - 0.99).abs() < 1e-5);
        assert!((fc.bias[0] + 0.01).abs() < 1e-5);
        assert_eq!(adam.t, 1);
    }
}
