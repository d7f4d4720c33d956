//! Fully-connected networks on ndarray
//!
//! Networks are plain stacks of affine layers with an activation between
//! them. Forward passes can keep a cache of intermediate values so that
//! [`FullyConnectedNetwork::backward`] can produce parameter gradients and the
//! gradient with respect to the input, which the actor-critic and planning
//! code needs to chain networks together.

use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use rlkit_core::{RLError, Result};

use crate::device::Device;
use crate::utils::polyak_update;

/// Activation applied after a hidden layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// max(0, x)
    #[default]
    Relu,
    /// tanh(x)
    Tanh,
    /// 1 / (1 + e^-x)
    Sigmoid,
    /// Identity
    Linear,
}

impl Activation {
    fn apply(self, x: &Array2<f32>) -> Array2<f32> {
        match self {
            Self::Relu => x.mapv(|v| v.max(0.0)),
            Self::Tanh => x.mapv(f32::tanh),
            Self::Sigmoid => x.mapv(sigmoid),
            Self::Linear => x.clone(),
        }
    }

    /// Derivative evaluated at the pre-activation values
    fn derivative(self, pre_activation: &Array2<f32>) -> Array2<f32> {
        match self {
            Self::Relu => pre_activation.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
            Self::Tanh => pre_activation.mapv(|v| 1.0 - v.tanh().powi(2)),
            Self::Sigmoid => pre_activation.mapv(|v| {
                let s = sigmoid(v);
                s * (1.0 - s)
            }),
            Self::Linear => Array2::ones(pre_activation.raw_dim()),
        }
    }
}

/// Logistic function
#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// One affine layer, `y = x W + b`
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    /// Weights, shape `(in, out)`
    pub weight: Array2<f32>,
    /// Bias, shape `(out,)`
    pub bias: Array1<f32>,
}

impl Linear {
    /// Xavier-uniform initialised layer with zero bias
    #[allow(clippy::cast_precision_loss)]
    pub fn xavier<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (in_dim + out_dim) as f32).sqrt();
        Self {
            weight: Array2::from_shape_fn((in_dim, out_dim), |_| rng.gen_range(-limit..limit)),
            bias: Array1::zeros(out_dim),
        }
    }
}

/// Values kept from a forward pass for backpropagation
#[derive(Debug, Clone)]
pub struct ForwardCache {
    inputs: Vec<Array2<f32>>,
    pre_activations: Vec<Array2<f32>>,
}

/// Parameter gradients of a [`FullyConnectedNetwork`], layer by layer
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    /// Weight gradients
    pub weights: Vec<Array2<f32>>,
    /// Bias gradients
    pub biases: Vec<Array1<f32>>,
}

impl Gradients {
    /// Zero gradients shaped like `network`
    #[must_use]
    pub fn zeros_like(network: &FullyConnectedNetwork) -> Self {
        Self {
            weights: network
                .layers
                .iter()
                .map(|l| Array2::zeros(l.weight.raw_dim()))
                .collect(),
            biases: network
                .layers
                .iter()
                .map(|l| Array1::zeros(l.bias.raw_dim()))
                .collect(),
        }
    }

    /// Multiply every gradient by `factor`
    pub fn scale(&mut self, factor: f32) {
        for w in &mut self.weights {
            *w *= factor;
        }
        for b in &mut self.biases {
            *b *= factor;
        }
    }

    /// Accumulate another set of gradients of the same structure
    pub fn accumulate(&mut self, other: &Self) -> Result<()> {
        if self.weights.len() != other.weights.len() {
            return Err(RLError::DimensionMismatch {
                expected: self.weights.len(),
                actual: other.weights.len(),
            });
        }
        for (w, o) in self.weights.iter_mut().zip(&other.weights) {
            if w.dim() != o.dim() {
                return Err(RLError::DimensionMismatch {
                    expected: w.len(),
                    actual: o.len(),
                });
            }
            *w += o;
        }
        for (b, o) in self.biases.iter_mut().zip(&other.biases) {
            *b += o;
        }
        Ok(())
    }

    /// Global L2 norm
    #[must_use]
    pub fn norm(&self) -> f32 {
        let weights: f32 = self.weights.iter().map(|w| w.iter().map(|v| v * v).sum::<f32>()).sum();
        let biases: f32 = self.biases.iter().map(|b| b.iter().map(|v| v * v).sum::<f32>()).sum();
        (weights + biases).sqrt()
    }

    /// Rescale so the global norm does not exceed `max_norm`
    pub fn clip_norm(&mut self, max_norm: f32) {
        let norm = self.norm();
        if norm > max_norm && norm > 0.0 {
            self.scale(max_norm / norm);
        }
    }
}

/// Multi-layer perceptron with a linear output layer
#[derive(Debug, Clone, PartialEq)]
pub struct FullyConnectedNetwork {
    layers: Vec<Linear>,
    activations: Vec<Activation>,
    device: Device,
}

impl FullyConnectedNetwork {
    /// Build a network with one activation per hidden layer
    pub fn new(
        input_dim: usize,
        hidden_sizes: &[usize],
        activations: &[Activation],
        output_dim: usize,
    ) -> Result<Self> {
        Self::with_rng(
            input_dim,
            hidden_sizes,
            activations,
            output_dim,
            &mut rand::thread_rng(),
        )
    }

    /// Build a network drawing initial weights from `rng`
    pub fn with_rng<R: Rng + ?Sized>(
        input_dim: usize,
        hidden_sizes: &[usize],
        activations: &[Activation],
        output_dim: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if activations.len() != hidden_sizes.len() {
            return Err(RLError::Configuration(format!(
                "{} hidden layers but {} activations",
                hidden_sizes.len(),
                activations.len()
            )));
        }
        if input_dim == 0 || output_dim == 0 || hidden_sizes.contains(&0) {
            return Err(RLError::Configuration(format!(
                "layer sizes must be positive (input {input_dim}, hidden {hidden_sizes:?}, output {output_dim})"
            )));
        }

        let mut layers = Vec::with_capacity(hidden_sizes.len() + 1);
        let mut prev_dim = input_dim;
        for &hidden_dim in hidden_sizes {
            layers.push(Linear::xavier(prev_dim, hidden_dim, rng));
            prev_dim = hidden_dim;
        }
        layers.push(Linear::xavier(prev_dim, output_dim, rng));

        Ok(Self {
            layers,
            activations: activations.to_vec(),
            device: Device::Host,
        })
    }

    /// Width of the expected input
    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, |l| l.weight.nrows())
    }

    /// Width of the output
    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, |l| l.weight.ncols())
    }

    /// Layers, input side first
    #[must_use]
    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    /// Mutable layers, input side first
    pub fn layers_mut(&mut self) -> &mut [Linear] {
        &mut self.layers
    }

    /// Number of trainable scalars
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.weight.len() + l.bias.len()).sum()
    }

    /// Device the parameters are placed on
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Place the parameters on `device`
    pub fn place(&mut self, device: Device) -> Result<()> {
        device.ensure_available()?;
        self.device = device;
        Ok(())
    }

    /// Forward pass over a `(batch, input_dim)` matrix
    pub fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_input(input)?;
        let mut hidden = input.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let z = hidden.dot(&layer.weight) + &layer.bias;
            hidden = match self.activations.get(i) {
                Some(activation) => activation.apply(&z),
                None => z,
            };
        }
        Ok(hidden)
    }

    /// Forward pass that keeps what [`Self::backward`] needs
    pub fn forward_with_cache(&self, input: &Array2<f32>) -> Result<(Array2<f32>, ForwardCache)> {
        self.check_input(input)?;
        let mut cache = ForwardCache {
            inputs: Vec::with_capacity(self.layers.len()),
            pre_activations: Vec::with_capacity(self.layers.len()),
        };
        let mut hidden = input.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let z = hidden.dot(&layer.weight) + &layer.bias;
            let next = match self.activations.get(i) {
                Some(activation) => activation.apply(&z),
                None => z.clone(),
            };
            cache.inputs.push(hidden);
            cache.pre_activations.push(z);
            hidden = next;
        }
        Ok((hidden, cache))
    }

    /// Backpropagate `grad_output` (dL/d output) through the cached pass.
    ///
    /// Returns the parameter gradients and dL/d input.
    pub fn backward(
        &self,
        cache: &ForwardCache,
        grad_output: &Array2<f32>,
    ) -> Result<(Gradients, Array2<f32>)> {
        let batch = cache.inputs.first().map_or(0, Array2::nrows);
        if grad_output.dim() != (batch, self.output_dim()) {
            return Err(RLError::Computation(format!(
                "output gradient has shape {:?}, expected ({batch}, {})",
                grad_output.dim(),
                self.output_dim()
            )));
        }
        if cache.inputs.len() != self.layers.len() {
            return Err(RLError::Computation(
                "forward cache does not belong to this network".to_string(),
            ));
        }

        let mut weights = Vec::with_capacity(self.layers.len());
        let mut biases = Vec::with_capacity(self.layers.len());
        let mut grad = grad_output.clone();
        for i in (0..self.layers.len()).rev() {
            if let Some(activation) = self.activations.get(i) {
                grad = grad * activation.derivative(&cache.pre_activations[i]);
            }
            weights.push(cache.inputs[i].t().dot(&grad));
            biases.push(grad.sum_axis(Axis(0)));
            grad = grad.dot(&self.layers[i].weight.t());
        }
        weights.reverse();
        biases.reverse();

        Ok((Gradients { weights, biases }, grad))
    }

    /// Move every parameter towards `source` by `tau`
    pub fn soft_update_from(&mut self, source: &Self, tau: f32) -> Result<()> {
        if self.layers.len() != source.layers.len() {
            return Err(RLError::DimensionMismatch {
                expected: self.layers.len(),
                actual: source.layers.len(),
            });
        }
        for (target, src) in self.layers.iter_mut().zip(&source.layers) {
            if target.weight.dim() != src.weight.dim() {
                return Err(RLError::DimensionMismatch {
                    expected: target.weight.len(),
                    actual: src.weight.len(),
                });
            }
            target
                .weight
                .zip_mut_with(&src.weight, |t, &s| *t = polyak_update(*t, s, tau));
            target
                .bias
                .zip_mut_with(&src.bias, |t, &s| *t = polyak_update(*t, s, tau));
        }
        Ok(())
    }

    fn check_input(&self, input: &Array2<f32>) -> Result<()> {
        if input.ncols() == self.input_dim() {
            Ok(())
        } else {
            Err(RLError::DimensionMismatch {
                expected: self.input_dim(),
                actual: input.ncols(),
            })
        }
    }
}
