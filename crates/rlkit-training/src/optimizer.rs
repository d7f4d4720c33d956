//! First-order optimizers for [`FullyConnectedNetwork`]

use serde::{Deserialize, Serialize};

use rlkit_core::{RLError, Result};

use crate::nn::{FullyConnectedNetwork, Gradients};

/// Update rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// Adam with bias correction
    #[default]
    Adam,
    /// Plain stochastic gradient descent
    Sgd,
}

/// Optimizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerParameters {
    /// Update rule
    pub optimizer: OptimizerKind,
    /// Step size
    pub learning_rate: f32,
    /// First-moment decay (Adam)
    pub beta1: f32,
    /// Second-moment decay (Adam)
    pub beta2: f32,
    /// Numerical floor of the Adam denominator
    pub eps: f32,
    /// Clip the global gradient norm to this value
    pub max_grad_norm: Option<f32>,
}

impl Default for OptimizerParameters {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::Adam,
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            max_grad_norm: None,
        }
    }
}

impl OptimizerParameters {
    /// Adam with the given learning rate
    #[must_use]
    pub fn adam(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }
}

/// Optimizer state bound to one network
#[derive(Debug, Clone)]
pub struct Optimizer {
    params: OptimizerParameters,
    momentum: Option<Gradients>,
    velocity: Option<Gradients>,
    t: i32,
}

impl Optimizer {
    /// Create optimizer state; moments are allocated on the first step
    #[must_use]
    pub fn new(params: OptimizerParameters) -> Self {
        Self {
            params,
            momentum: None,
            velocity: None,
            t: 0,
        }
    }

    /// Configuration
    #[must_use]
    pub fn parameters(&self) -> &OptimizerParameters {
        &self.params
    }

    /// Apply `grads` (dL/dθ) to `network`
    pub fn step(&mut self, network: &mut FullyConnectedNetwork, mut grads: Gradients) -> Result<()> {
        check_structure(network, &grads)?;
        if let Some(max_norm) = self.params.max_grad_norm {
            grads.clip_norm(max_norm);
        }
        let lr = self.params.learning_rate;

        match self.params.optimizer {
            OptimizerKind::Sgd => {
                for (layer, (gw, gb)) in network
                    .layers_mut()
                    .iter_mut()
                    .zip(grads.weights.iter().zip(&grads.biases))
                {
                    layer.weight.scaled_add(-lr, gw);
                    layer.bias.scaled_add(-lr, gb);
                }
            }
            OptimizerKind::Adam => {
                let (b1, b2, eps) = (self.params.beta1, self.params.beta2, self.params.eps);
                let momentum = self
                    .momentum
                    .get_or_insert_with(|| Gradients::zeros_like(network));
                let velocity = self
                    .velocity
                    .get_or_insert_with(|| Gradients::zeros_like(network));
                self.t = self.t.saturating_add(1);
                let c1 = 1.0 - b1.powi(self.t);
                let c2 = 1.0 - b2.powi(self.t);

                for (i, layer) in network.layers_mut().iter_mut().enumerate() {
                    let g = &grads.weights[i];
                    momentum.weights[i] = &momentum.weights[i] * b1 + &(g * (1.0 - b1));
                    velocity.weights[i] = &velocity.weights[i] * b2 + &(g * g * (1.0 - b2));
                    let update = (&momentum.weights[i] / c1)
                        / (velocity.weights[i].mapv(|v| (v / c2).sqrt()) + eps);
                    layer.weight.scaled_add(-lr, &update);

                    let g = &grads.biases[i];
                    momentum.biases[i] = &momentum.biases[i] * b1 + &(g * (1.0 - b1));
                    velocity.biases[i] = &velocity.biases[i] * b2 + &(g * g * (1.0 - b2));
                    let update = (&momentum.biases[i] / c1)
                        / (velocity.biases[i].mapv(|v| (v / c2).sqrt()) + eps);
                    layer.bias.scaled_add(-lr, &update);
                }
            }
        }
        Ok(())
    }
}

fn check_structure(network: &FullyConnectedNetwork, grads: &Gradients) -> Result<()> {
    let layers = network.layers();
    if grads.weights.len() != layers.len() || grads.biases.len() != layers.len() {
        return Err(RLError::DimensionMismatch {
            expected: layers.len(),
            actual: grads.weights.len(),
        });
    }
    for ((layer, gw), gb) in layers.iter().zip(&grads.weights).zip(&grads.biases) {
        if layer.weight.dim() != gw.dim() || layer.bias.len() != gb.len() {
            return Err(RLError::DimensionMismatch {
                expected: layer.weight.len(),
                actual: gw.len(),
            });
        }
    }
    Ok(())
}
