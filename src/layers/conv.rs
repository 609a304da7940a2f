use crate::model::{Module, Param};
use ndarray::prelude::*;
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f32;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Output size is `ceil(input / stride)`; the input is zero padded,
    /// with the odd extra row/column going to the bottom/right.
    Same,
    /// No padding, the output shrinks by `k - 1` before striding.
    Valid,
}

/// Where the kernel lands on an input of a given size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    in_h: usize,
    in_w: usize,
    out_h: usize,
    out_w: usize,
    pad_top: usize,
    pad_left: usize,
    padded_h: usize,
    padded_w: usize,
}

fn axis_geometry(input: usize, k: usize, stride: usize, padding: Padding) -> (usize, usize, usize) {
    match padding {
        Padding::Same => {
            let out = input.div_ceil(stride);
            let pad_total = ((out - 1) * stride + k).saturating_sub(input);
            (out, pad_total / 2, input + pad_total)
        }
        Padding::Valid => {
            assert!(input >= k, "valid convolution needs input ({input}) >= kernel ({k})");
            ((input - k) / stride + 1, 0, input)
        }
    }
}

/// 2D convolution layer with configurable stride and padding.
/// pytorch doc: https://docs.pytorch.org/docs/stable/generated/torch.nn.Conv2d.html
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Conv2Dlayer {
    in_channels: usize,          // Number of channels in the input image
    out_channels: usize,         // Number of channels produced by the convolution
    kernel_size: (usize, usize), // Size of all the 2d convolving kernels used in this layer.
    stride: usize,
    padding: Padding,
    // weights
    pub kernels_mat: Array2<f32>, // Layout for img2col: (out_channels, in_channels*k^2)
    pub b: Array1<f32>,           // One bias per output channel: (output_channels)
    // for backprop
    #[serde(skip)]
    last_input: Option<Array3<f32>>, // The 'patches' matrix in img2col: (batch_size, locations, in_channels * k^2)
    #[serde(skip)]
    last_geometry: Option<Geometry>,
    //
    #[serde(skip)]
    pub k_grad: Option<Array2<f32>>, // (out_channels, in_channels * k^2)
    #[serde(skip)]
    pub b_grad: Option<Array1<f32>>, // (out_channels)
}

impl Conv2Dlayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        stride: usize,
        padding: Padding,
        rng: &mut R,
    ) -> Conv2Dlayer {
        assert!(stride > 0, "stride must be positive");
        Conv2Dlayer {
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            //
            kernels_mat: Conv2Dlayer::init_kernel(in_channels, out_channels, kernel_size, rng),
            b: Array1::zeros(out_channels),
            //
            last_input: None,
            last_geometry: None,
            //
            k_grad: None,
            b_grad: None,
        }
    }

    fn get_scale(in_channels: usize, kernel_size: (usize, usize)) -> f32 {
        (6.0 / (in_channels * kernel_size.0 * kernel_size.1) as f32).sqrt() // uniform He init
    }

    fn init_kernel<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        rng: &mut R,
    ) -> Array2<f32> {
        assert!(kernel_size.0 == kernel_size.1);
        let k = kernel_size.0;
        // Kernel weights layed-out for the 'img2col' method to compute the convolution.
        // Dimensions: (out_channels, in_channels*k^2)
        Array2::random_using(
            (out_channels, in_channels * k * k),
            Uniform::new(-1.0, 1.0),
            rng,
        ) * Conv2Dlayer::get_scale(in_channels, kernel_size)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Spatial output size for an input of `(height, width)`.
    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        let g = self.geometry(height, width);
        (g.out_h, g.out_w)
    }

    fn geometry(&self, in_h: usize, in_w: usize) -> Geometry {
        let k = self.kernel_size.0;
        let (out_h, pad_top, padded_h) = axis_geometry(in_h, k, self.stride, self.padding);
        let (out_w, pad_left, padded_w) = axis_geometry(in_w, k, self.stride, self.padding);
        Geometry {
            in_h,
            in_w,
            out_h,
            out_w,
            pad_top,
            pad_left,
            padded_h,
            padded_w,
        }
    }

    /// Lay every kernel location of one sample out as a row:
    /// (in_channels, height, width) -> (locations, in_channels * k^2)
    fn im2col(&self, sample: ArrayView3<f32>, g: &Geometry) -> Array2<f32> {
        let k = self.kernel_size.0;
        let s = self.stride;
        let mut padded = Array3::<f32>::zeros((self.in_channels, g.padded_h, g.padded_w));
        padded
            .slice_mut(s![
                ..,
                g.pad_top..g.pad_top + g.in_h,
                g.pad_left..g.pad_left + g.in_w
            ])
            .assign(&sample);

        let mut patches_mat = Array2::zeros((g.out_h * g.out_w, self.in_channels * k * k));
        for (loc, mut row) in patches_mat.rows_mut().into_iter().enumerate() {
            let (y, x) = ((loc / g.out_w) * s, (loc % g.out_w) * s);
            let patch = padded.slice(s![.., y..y + k, x..x + k]);
            row.assign(&patch.flatten());
        }
        patches_mat
    }

    /// Scatter patch gradients back onto the input, dropping the padding.
    /// (locations, in_channels * k^2) -> (in_channels, height, width)
    fn col2im(&self, dpatches: &Array2<f32>, g: &Geometry) -> Array3<f32> {
        let k = self.kernel_size.0;
        let s = self.stride;
        let mut dpadded = Array3::<f32>::zeros((self.in_channels, g.padded_h, g.padded_w));
        for (loc, row) in dpatches.rows().into_iter().enumerate() {
            let (y, x) = ((loc / g.out_w) * s, (loc % g.out_w) * s);
            let patch_grad = row
                .to_shape((self.in_channels, k, k))
                .expect("patch row reshapes to (in_channels, k, k)");
            // accumulating: overlapping windows share input pixels
            let mut window = dpadded.slice_mut(s![.., y..y + k, x..x + k]);
            window += &patch_grad;
        }
        dpadded
            .slice(s![
                ..,
                g.pad_top..g.pad_top + g.in_h,
                g.pad_left..g.pad_left + g.in_w
            ])
            .to_owned()
    }
}

impl Module for Conv2Dlayer {
    /// Forward for the convolution layer using the 'img2col' method.
    ///
    /// The 'img2col' idea is to map the convolution operation to a single matmul.
    /// The goal is to compute OUT = kernels_mat x patches_mat^T, where each row of
    /// patches_mat is an entire (zero padded, strided) input patch.
    /// In terms of size (omitting the batch dim):
    /// - kernels_mat: (out_channels, channels_in * k^2)
    /// - patches_mat: (locations, channels_in * k^2)
    /// So their product yields (out_channels, locations).
    ///
    /// Samples of the batch are independent and computed in parallel.
    ///
    /// Input: (batch_size, in_channels, height, width)
    /// Output: (batch_size, out_channels, out_height, out_width)
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        tracing::trace!("[forward] [conv] input: {:?}", input.shape());
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("Conv layer input should be 4D");

        let (batch_size, in_channels, in_height, in_width) = input.dim();
        assert!(in_channels == self.in_channels);
        let k = self.kernel_size.0;
        let g = self.geometry(in_height, in_width);
        let nb_locations = g.out_h * g.out_w;

        let this = &*self;
        let per_sample: Vec<(Array2<f32>, Array3<f32>)> = (0..batch_size)
            .into_par_iter()
            .map(|batch_idx| {
                let patches_mat = this.im2col(input.index_axis(Axis(0), batch_idx), &g);
                // (out_channels, L) = (out_channels, in_channels*k^2) dot (L, in_channels*k^2)^T
                let mut flat_out = this.kernels_mat.dot(&patches_mat.t());
                // same bias per output channel, broadcast over locations
                flat_out += &this.b.view().insert_axis(Axis(1));
                let out = flat_out
                    .into_shape_with_order((this.out_channels, g.out_h, g.out_w))
                    .expect("(out_channels, L) reshapes to (out_channels, out_h, out_w)");
                (patches_mat, out)
            })
            .collect();

        let mut out = Array4::zeros((batch_size, self.out_channels, g.out_h, g.out_w));
        let mut last_input = Array3::<f32>::zeros((batch_size, nb_locations, in_channels * k * k));
        for (batch_idx, (patches_mat, sample_out)) in per_sample.into_iter().enumerate() {
            last_input.index_axis_mut(Axis(0), batch_idx).assign(&patches_mat);
            out.index_axis_mut(Axis(0), batch_idx).assign(&sample_out);
        }

        self.last_input = Some(last_input);
        self.last_geometry = Some(g);
        out.into_dyn()
    }

    /// Backward for the convolution layer using the 'img2col' method.
    ///
    /// Per sample, with dz reshaped to (out_channels, locations):
    /// - dL/dkernels_mat = dz dot patches_mat, summed over the batch
    /// - dL/dbias = dz summed over locations and batch
    /// - dL/dpatches_mat = dz^T dot kernels_mat, scattered back onto the
    ///   (padded) input and cropped to the input size.
    ///
    /// Gradients are summed, not averaged: the loss already carries its own
    /// normalization.
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        tracing::trace!("[backward] [conv] incoming dz: {:?}", dz.shape());
        let dz = dz
            .into_dimensionality::<Ix4>()
            .expect("[backward] [conv] incoming dz is 4D");
        let (batch_size, out_channels, out_height, out_width) = dz.dim();
        let g = self.last_geometry.expect("Run forward before the backward");
        assert_eq!((out_height, out_width), (g.out_h, g.out_w));

        let nb_locations = out_height * out_width;
        let dz = dz
            .to_shape((batch_size, out_channels, nb_locations))
            .expect("[backward] [conv] incoming dz is compatible with img2col shape");

        let last_patches = self
            .last_input
            .as_ref()
            .expect("Run forward before the backward");

        let this = &*self;
        let per_sample: Vec<(Array2<f32>, Array1<f32>, Array3<f32>)> = (0..batch_size)
            .into_par_iter()
            .map(|batch_idx| {
                let dz_sample = dz.index_axis(Axis(0), batch_idx);
                let patches = last_patches.index_axis(Axis(0), batch_idx);
                // (out_channels, in_channels*k^2) = (out_channels, L) dot (L, in_channels*k^2)
                let dkernels = dz_sample.dot(&patches);
                let dbias = dz_sample.sum_axis(Axis(1));
                // (L, in_channels*k^2) = (out_channels, L)^T dot (out_channels, in_channels*k^2)
                let dpatches = dz_sample.t().dot(&this.kernels_mat);
                (dkernels, dbias, this.col2im(&dpatches, &g))
            })
            .collect();

        let mut k_grad = Array2::<f32>::zeros(self.kernels_mat.raw_dim());
        let mut b_grad = Array1::<f32>::zeros(self.out_channels);
        let mut dinput = Array4::<f32>::zeros((batch_size, self.in_channels, g.in_h, g.in_w));
        for (batch_idx, (dkernels, dbias, dsample)) in per_sample.into_iter().enumerate() {
            k_grad += &dkernels;
            b_grad += &dbias;
            dinput.index_axis_mut(Axis(0), batch_idx).assign(&dsample);
        }
        self.k_grad = Some(k_grad);
        self.b_grad = Some(b_grad);

        dinput.into_dyn()
    }

    fn zero_grad(&mut self) {
        self.k_grad = None;
        self.b_grad = None;
    }

    fn params(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                name: "kernel",
                value: self.kernels_mat.view_mut().into_dyn(),
                grad: self.k_grad.as_ref().map(|g| g.view().into_dyn()),
            },
            Param {
                name: "bias",
                value: self.b.view_mut().into_dyn(),
                grad: self.b_grad.as_ref().map(|g| g.view().into_dyn()),
            },
        ]
    }
}

/// Max pooling with a square window and stride equal to the window.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MaxPoolLayer {
    pool_size: (usize, usize),
    // for backprop
    #[serde(skip)]
    last_input_max_mask: Option<Array6<f32>>, // (batch_size, in_channels, height/k, k, width/k, k)
}

impl MaxPoolLayer {
    pub fn new(pool_size: (usize, usize)) -> MaxPoolLayer {
        assert!(pool_size.0 == pool_size.1);
        MaxPoolLayer {
            pool_size,
            last_input_max_mask: None,
        }
    }

    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        (height / self.pool_size.0, width / self.pool_size.0)
    }
}

impl Module for MaxPoolLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("[forward] [maxPool] input is a 4D tensor");

        let (batch_size, in_channels, height, width) = input.dim();
        let k = self.pool_size.0;
        assert!(
            height % k == 0 && width % k == 0,
            "[forward] [maxPool] input {height}x{width} is not divisible by the pool size {k}"
        );

        // Reshape to (batch_size, in_channels, height / k, k, width / k, k)
        let input_6d = input
            .to_shape((batch_size, in_channels, height / k, k, width / k, k))
            .expect("[forward] [maxPool] input is compatible with 6D tensor for the pooling");

        // Fold the dims with size k, i.e axis 3 and 5 of input
        let pooled: Array4<f32> = input_6d
            .fold_axis(Axis(3), f32::NEG_INFINITY, |&a, &b| a.max(b))
            .fold_axis(Axis(5 - 1), f32::NEG_INFINITY, |&a, &b| a.max(b));

        // Mask of the max positions for backprop. Only the first max of each
        // window is marked so ties do not duplicate the gradient.
        let mut input_mask_6d = Array6::zeros((batch_size, in_channels, height / k, k, width / k, k));
        for ((b, c, i, j), &max_val) in pooled.indexed_iter() {
            'window: for di in 0..k {
                for dj in 0..k {
                    if input_6d[[b, c, i, di, j, dj]] == max_val {
                        input_mask_6d[[b, c, i, di, j, dj]] = 1.0;
                        break 'window;
                    }
                }
            }
        }

        self.last_input_max_mask = Some(input_mask_6d);

        pooled.into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        // dz: (batch_size, channels, height/k, width/k)
        let dz = dz
            .into_dimensionality::<Ix4>()
            .expect("[backward] [maxPool] dz is 4D");

        let (batch_size, channels, out_height, out_width) = dz.dim();
        let k = self.pool_size.0;
        let (height, width) = (out_height * k, out_width * k);

        let dz_6d = dz
            .to_shape((batch_size, channels, out_height, 1, out_width, 1))
            .expect("[backward] [maxPool] dz reshapes to 6D");

        let input_mask = self
            .last_input_max_mask
            .as_ref()
            .expect("[backward] [maxPool] Run forward before backward");

        // gradient flows only to the marked max positions
        let dinput = input_mask * &dz_6d;

        dinput
            .into_shape_with_order((batch_size, channels, height, width))
            .expect("[backward] [maxPool] dinput is compatible with expected 4D tensor")
            .into_dyn()
    }

    fn zero_grad(&mut self) {
        self.last_input_max_mask = None;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FlattenLayer {
    #[serde(skip)]
    last_shape: Option<Vec<usize>>,
}

impl FlattenLayer {
    pub fn new() -> FlattenLayer {
        FlattenLayer { last_shape: None }
    }
}

impl Module for FlattenLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        self.last_shape = Some(input.shape().to_vec());
        // Assuming the input is a batch of feature maps
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("Flatten layer input should be 4D");
        let (batch_size, in_channels, height, width) = input.dim();
        input
            .to_shape((batch_size, in_channels * height * width))
            .expect("flatten input to 2D array should not fail")
            .to_owned()
            .into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let shape = self
            .last_shape
            .as_ref()
            .expect("Need to do a forward pass before the backward");
        dz.to_shape(shape.as_slice())
            .expect("should be able to reshape the incoming gradient")
            .to_owned()
    }

    fn zero_grad(&mut self) {
        self.last_shape = None;
    }
}
