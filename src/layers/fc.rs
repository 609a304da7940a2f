use crate::model::{Module, Param};

use ndarray::prelude::*;
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use serde::{Deserialize, Serialize};
use std::f32;

#[derive(Serialize, Deserialize, Debug, Clone)]
///  z = W.a_prev + b
pub struct FcLayer {
    input_size: usize,
    output_size: usize,
    //
    pub weights: Array2<f32>, // (input_size, output_size)
    pub bias: Array1<f32>,    //  (output_size)
    // for backprop
    #[serde(skip)]
    last_input: Option<Array2<f32>>, // (batch_size, input_size), this is the prev layer activation
    //
    #[serde(skip)]
    pub w_grad: Option<Array2<f32>>, // (input_size, output_size)
    #[serde(skip)]
    pub b_grad: Option<Array1<f32>>, // (output_size)
}

impl FcLayer {
    pub fn new<R: Rng + ?Sized>(input_size: usize, output_size: usize, rng: &mut R) -> FcLayer {
        FcLayer {
            input_size,
            output_size,
            weights: Array2::random_using((input_size, output_size), Uniform::new(-1.0, 1.0), rng)
                * FcLayer::get_scale(input_size),
            bias: Array1::zeros(output_size),
            //
            last_input: None,
            //
            w_grad: None,
            b_grad: None,
        }
    }

    fn get_scale(input_size: usize) -> f32 {
        (2.0 / input_size as f32).sqrt()
    }
}

impl Module for FcLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix2>()
            .expect("FC layer input should be 2D");
        assert_eq!(input.ncols(), self.input_size, "FC layer input width");

        // (batch_size, input_size) X (input_size, output_size) = (batch_size, output_size)
        let out = input.dot(&self.weights) + &self.bias;
        self.last_input = Some(input);
        out.into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let dz = dz
            .into_dimensionality::<Ix2>()
            .expect("FC layer backward input should be 2D");

        let last_input = self
            .last_input
            .take()
            .expect("Need to do a forward pass before the backward");

        // w: (batch_size, input_size)^T X (batch_size, output_size) = (input_size, output_size)
        self.w_grad = Some(last_input.t().dot(&dz));
        // b: (batch_size, output_size) summed over batch-axis = (output_size)
        self.b_grad = Some(dz.sum_axis(Axis(0)));

        //  What needs to be passed on to the 'previous' layer in the network
        //  (batch_size, output_size) X (input_size, output_size)^T
        dz.dot(&self.weights.t()).into_dyn()
    }

    fn zero_grad(&mut self) {
        self.w_grad = None;
        self.b_grad = None;
    }

    fn params(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                name: "weights",
                value: self.weights.view_mut().into_dyn(),
                grad: self.w_grad.as_ref().map(|g| g.view().into_dyn()),
            },
            Param {
                name: "bias",
                value: self.bias.view_mut().into_dyn(),
                grad: self.b_grad.as_ref().map(|g| g.view().into_dyn()),
            },
        ]
    }
}
