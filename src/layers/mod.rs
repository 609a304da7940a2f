pub use crate::layers::activations::{softmax, ReluLayer};
pub use crate::layers::conv::{Conv2Dlayer, FlattenLayer, MaxPoolLayer, Padding};
pub use crate::layers::fc::FcLayer;
pub use crate::model::{Module, Param};

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

pub mod activations;
pub mod conv;
pub mod fc;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Layer {
    FC(FcLayer),
    Conv(Conv2Dlayer),
    Pool(MaxPoolLayer),
    ReLU(ReluLayer),
    Flatten(FlattenLayer),
}

impl Layer {
    /// Short name used to build parameter ids.
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::FC(_) => "fc",
            Layer::Conv(_) => "conv",
            Layer::Pool(_) => "pool",
            Layer::ReLU(_) => "relu",
            Layer::Flatten(_) => "flatten",
        }
    }
}

impl Module for Layer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::FC(l) => l.forward(input),
            Layer::Conv(l) => l.forward(input),
            Layer::Pool(l) => l.forward(input),
            Layer::ReLU(l) => l.forward(input),
            Layer::Flatten(l) => l.forward(input),
        }
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::FC(l) => l.backward(dz),
            Layer::Conv(l) => l.backward(dz),
            Layer::Pool(l) => l.backward(dz),
            Layer::ReLU(l) => l.backward(dz),
            Layer::Flatten(l) => l.backward(dz),
        }
    }

    fn zero_grad(&mut self) {
        match self {
            Layer::FC(l) => l.zero_grad(),
            Layer::Conv(l) => l.zero_grad(),
            Layer::Pool(l) => l.zero_grad(),
            Layer::ReLU(l) => l.zero_grad(),
            Layer::Flatten(l) => l.zero_grad(),
        }
    }

    fn params(&mut self) -> Vec<Param<'_>> {
        match self {
            Layer::FC(l) => l.params(),
            Layer::Conv(l) => l.params(),
            Layer::Pool(_) | Layer::ReLU(_) | Layer::Flatten(_) => Vec::new(),
        }
    }
}
