use crate::model::Module;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use std::f32;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReluLayer {
    #[serde(skip)]
    last_input: Option<ArrayD<f32>>,
}

impl ReluLayer {
    pub fn new() -> ReluLayer {
        ReluLayer { last_input: None }
    }
}

impl Module for ReluLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let out = input.mapv(|x| x.max(0.0));
        self.last_input = Some(input);
        out
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let last_input = self.last_input.as_ref().expect("run forward before backward");
        let mut dx = dz;
        dx.zip_mut_with(last_input, |d, &x| {
            if x <= 0.0 {
                *d = 0.0
            }
        });
        dx
    }

    fn zero_grad(&mut self) {
        self.last_input = None;
    }
}

/// Row-wise softmax of a (batch_size, num_classes) matrix.
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let max = logits.fold_axis(Axis(1), f32::NEG_INFINITY, |&a, &b| a.max(b));
    // exp(x - max)
    let mut out = logits - &max.insert_axis(Axis(1));
    out.mapv_inplace(|x| x.exp());

    let sum = out.sum_axis(Axis(1));
    out / &sum.insert_axis(Axis(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_rows_sum_to_one() {
        let logits = array![[1.0f32, 2.0, 3.0], [1000.0, 1000.0, 1000.0]];
        let probs = softmax(&logits);
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((probs[(1, 0)] - 1.0 / 3.0).abs() < 1e-6);
        assert!(probs[(0, 2)] > probs[(0, 1)]);
    }

    #[test]
    fn relu_blocks_negative_gradient() {
        let mut relu = ReluLayer::new();
        let out = relu.forward(array![-1.0f32, 0.5].into_dyn());
        assert_eq!(out, array![0.0f32, 0.5].into_dyn());
        let dx = relu.backward(array![3.0f32, 3.0].into_dyn());
        assert_eq!(dx, array![0.0f32, 3.0].into_dyn());
    }
}
