use crate::config::IMAGE_DIM;
use crate::error::{Error, Result};
use crate::layers::{softmax, Conv2Dlayer, FcLayer, FlattenLayer, Layer, MaxPoolLayer, Padding, ReluLayer};
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

pub trait Module {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32>; // Input is (batch_size, features...)
    /// Backward pass
    ///
    /// The `backward` function receives a gradient `dz` which corresponds to dLoss/dz,
    /// where z is the current layer output.
    /// The job of the backward pass is to combine its 'local gradients' - namely dz/dx, dz/dw -
    /// with this incoming gradient - dLoss/dz - using the chain rule.
    /// The backward should:
    /// - return dLoss/dx = dz/dx * dLoss/dz
    /// - fill in the gradients for the layer's own weights dLoss/dw = dz/dw * dLoss/dz
    ///
    /// Note:
    /// - the dz/dx Jacobian matrix is not materialized (too wasteful). Instead, each layer
    /// directly computes the matrix-vector product of interest.
    /// - the shape of the function output - which corresponds to dLoss/dx - is the same shape
    /// as the layer inputs.
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32>;
    fn zero_grad(&mut self);
    /// Trainable tensors and their current gradients, always in the same order.
    fn params(&mut self) -> Vec<Param<'_>> {
        Vec::new()
    }
}

/// A trainable tensor borrowed from its layer, next to its gradient (if a
/// backward pass filled one).
pub struct Param<'a> {
    pub name: &'static str,
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: Option<ArrayViewD<'a, f32>>,
}

/// Raw logits and their softmax.
#[derive(Debug, Clone)]
pub struct Output {
    pub logits: Array2<f32>, // (batch_size, num_classes), no activation
    pub probs: Array2<f32>,  // softmax(logits)
}

/// Named parameter tensors, the checkpointed form of a model.
pub type ParamStore = BTreeMap<String, ArrayD<f32>>;

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    num_classes: usize,
    params: ParamStore,
}

/// The convolutional encoder-classifier.
///
/// (b, 1, 28, 28)
///   conv 5x5 -> 32, same, relu   (b, 32, 28, 28)
///   max-pool 2x2                 (b, 32, 14, 14)
///   conv 5x5 -> 64, /2, relu     (b, 64, 7, 7)
///   conv 7x7 -> 128, valid, relu (b, 128, 1, 1)
///   conv 1x1 -> 64, linear       (b, 64, 1, 1)
///   flatten                      (b, 64)
///   fc -> num_classes, linear    (b, num_classes)
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConvClassifier {
    pub layers: Vec<Layer>,
    num_classes: usize,
}

impl Module for ConvClassifier {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let mut x = input;
        for layer in &mut self.layers {
            x = layer.forward(x);
        }
        x
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let mut x = dz;
        // Iterate layers in reverse order, mutate each as we go
        for layer in self.layers.iter_mut().rev() {
            x = layer.backward(x);
        }
        x
    }

    fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.zero_grad();
        }
    }

    fn params(&mut self) -> Vec<Param<'_>> {
        self.layers.iter_mut().flat_map(|l| l.params()).collect()
    }
}

impl ConvClassifier {
    pub fn new(num_classes: usize, seed: u64) -> ConvClassifier {
        let mut rng = StdRng::seed_from_u64(seed);
        let conv1 = Conv2Dlayer::new(1, 32, (5, 5), 1, Padding::Same, &mut rng);
        let pool = MaxPoolLayer::new((2, 2));
        let conv2 = Conv2Dlayer::new(32, 64, (5, 5), 2, Padding::Same, &mut rng);
        let conv3 = Conv2Dlayer::new(64, 128, (7, 7), 1, Padding::Valid, &mut rng);
        let conv4 = Conv2Dlayer::new(128, 64, (1, 1), 1, Padding::Same, &mut rng);

        // 28 -> 28 -> 14 -> 7 -> 1 -> 1
        let (h, w) = conv1.output_size(IMAGE_DIM, IMAGE_DIM);
        let (h, w) = pool.output_size(h, w);
        let (h, w) = conv2.output_size(h, w);
        let (h, w) = conv3.output_size(h, w);
        let (h, w) = conv4.output_size(h, w);
        let flat = conv4.out_channels() * h * w;

        ConvClassifier {
            layers: vec![
                Layer::Conv(conv1),
                Layer::ReLU(ReluLayer::new()),
                Layer::Pool(pool),
                Layer::Conv(conv2),
                Layer::ReLU(ReluLayer::new()),
                Layer::Conv(conv3),
                Layer::ReLU(ReluLayer::new()),
                Layer::Conv(conv4),
                Layer::Flatten(FlattenLayer::new()),
                Layer::FC(FcLayer::new(flat, num_classes, &mut rng)),
            ],
            num_classes,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Forward a batch of NCHW images, returning raw logits and softmax.
    pub fn predict(&mut self, images: &Array4<f32>) -> Output {
        let logits = self
            .forward(images.clone().into_dyn())
            .into_dimensionality::<Ix2>()
            .expect("Network output should be 2D: (batch_size, num_classes)");
        let probs = softmax(&logits);
        Output { logits, probs }
    }

    /// Named copy of every trainable tensor, e.g. `layer0.conv.kernel`.
    pub fn param_store(&self) -> ParamStore {
        let mut store = ParamStore::new();
        for (i, layer) in self.layers.iter().enumerate() {
            let prefix = format!("layer{i}.{}", layer.kind());
            match layer {
                Layer::Conv(l) => {
                    store.insert(format!("{prefix}.kernel"), l.kernels_mat.clone().into_dyn());
                    store.insert(format!("{prefix}.bias"), l.b.clone().into_dyn());
                }
                Layer::FC(l) => {
                    store.insert(format!("{prefix}.weights"), l.weights.clone().into_dyn());
                    store.insert(format!("{prefix}.bias"), l.bias.clone().into_dyn());
                }
                _ => {}
            }
        }
        store
    }

    /// Overwrite every trainable tensor from `store`.
    ///
    /// Fails without touching the model if a tensor is missing, has the
    /// wrong shape, or the store holds ids this model does not know.
    pub fn load_param_store(&mut self, store: &ParamStore) -> Result<()> {
        let expected = self.param_store();
        for (name, value) in &expected {
            match store.get(name) {
                None => return Err(Error::Checkpoint(format!("missing parameter {name}"))),
                Some(t) if t.shape() != value.shape() => {
                    return Err(Error::Checkpoint(format!(
                        "parameter {name} has shape {:?}, expected {:?}",
                        t.shape(),
                        value.shape()
                    )))
                }
                Some(_) => {}
            }
        }
        if let Some(extra) = store.keys().find(|k| !expected.contains_key(*k)) {
            return Err(Error::Checkpoint(format!("unknown parameter {extra}")));
        }

        for (i, layer) in self.layers.iter_mut().enumerate() {
            let prefix = format!("layer{i}.{}", layer.kind());
            for mut param in layer.params() {
                let source = &store[&format!("{prefix}.{}", param.name)];
                param.value.assign(source);
            }
        }
        Ok(())
    }

    /// Save the parameters to a JSON checkpoint file
    pub fn to_checkpoint(&self, filepath: &Path) -> Result<()> {
        if let Some(parent) = filepath.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let checkpoint = Checkpoint {
            num_classes: self.num_classes,
            params: self.param_store(),
        };
        let file = File::create(filepath).map_err(|e| Error::io(filepath, e))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer(&mut out, &checkpoint)?;
        out.flush().map_err(|e| Error::io(filepath, e))?;
        Ok(())
    }

    /// Rebuild the architecture and load parameters from a checkpoint file
    pub fn from_checkpoint(filepath: &Path) -> Result<ConvClassifier> {
        let file = File::open(filepath).map_err(|e| Error::io(filepath, e))?;
        let checkpoint: Checkpoint = serde_json::from_reader(BufReader::new(file))?;
        let mut model = ConvClassifier::new(checkpoint.num_classes, 0);
        model.load_param_store(&checkpoint.params)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    fn images(batch: usize, seed: u64) -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array4::random_using((batch, 1, 28, 28), Uniform::new(-1.0, 1.0), &mut rng)
    }

    #[test]
    fn output_shapes() {
        let mut model = ConvClassifier::new(10, 1);
        let out = model.predict(&images(3, 2));
        assert_eq!(out.logits.shape(), &[3, 10]);
        assert_eq!(out.probs.shape(), &[3, 10]);
        for row in out.probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn param_store_names_and_shapes() {
        let model = ConvClassifier::new(10, 1);
        let store = model.param_store();
        assert_eq!(store.len(), 10);
        assert_eq!(store["layer0.conv.kernel"].shape(), &[32, 25]);
        assert_eq!(store["layer3.conv.kernel"].shape(), &[64, 32 * 25]);
        assert_eq!(store["layer5.conv.kernel"].shape(), &[128, 64 * 49]);
        assert_eq!(store["layer7.conv.kernel"].shape(), &[64, 128]);
        assert_eq!(store["layer9.fc.weights"].shape(), &[64, 10]);
        assert_eq!(store["layer9.fc.bias"].shape(), &[10]);
    }

    #[test]
    fn checkpoint_restores_identical_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/part_1.ckpt.json");
        let batch = images(2, 4);

        let mut model = ConvClassifier::new(10, 9);
        let before = model.predict(&batch);
        model.to_checkpoint(&path).unwrap();

        let mut restored = ConvClassifier::from_checkpoint(&path).unwrap();
        let after = restored.predict(&batch);
        assert_eq!(before.logits, after.logits);
    }

    #[test]
    fn mismatched_store_is_rejected() {
        let mut model = ConvClassifier::new(10, 1);
        let mut store = ConvClassifier::new(5, 1).param_store();
        assert!(matches!(model.load_param_store(&store), Err(Error::Checkpoint(_))));

        store = model.param_store();
        store.insert("layer42.fc.bias".to_string(), ArrayD::zeros(vec![1]));
        assert!(matches!(model.load_param_store(&store), Err(Error::Checkpoint(_))));

        store.remove("layer42.fc.bias");
        store.remove("layer0.conv.bias");
        assert!(matches!(model.load_param_store(&store), Err(Error::Checkpoint(_))));
    }
}
