//! Probabilistic world model and its trainer
//!
//! The model maps `(state, action)` to a diagonal Gaussian over the next
//! state, a reward estimate and a not-terminal logit. Training minimises a
//! weighted sum of the Gaussian negative log-likelihood (`gmm`), the reward
//! squared error (`mse`) and the not-terminal cross-entropy (`bce`).

use std::f32::consts::PI;

use metrics::histogram;
use ndarray::{concatenate, s, Array1, Array2, Axis};
use tracing::debug;

use rlkit_core::{PolicyActionSet, RLError, Result, TrainingMetrics};

use crate::device::Device;
use crate::nn::{sigmoid, FullyConnectedNetwork};
use crate::optimizer::{Optimizer, OptimizerParameters};
use crate::parameters::WorldModelParameters;
use crate::trainer::{read_network, write_network, ObserverSet, SharedNetwork, Trainer};
use crate::types::{MemoryNetworkInput, TrainingBatch};
use crate::utils::RollingMean;

const LOG_SIGMA_MIN: f32 = -5.0;
const LOG_SIGMA_MAX: f32 = 2.0;

/// One-step predictive model of the environment
#[derive(Debug, Clone, PartialEq)]
pub struct WorldModel {
    body: FullyConnectedNetwork,
    state_dim: usize,
    action_dim: usize,
}

/// Predictions of a [`WorldModel`] for a batch
#[derive(Debug, Clone, PartialEq)]
pub struct WorldModelOutput {
    /// Mean of the next state
    pub next_state_mean: Array2<f32>,
    /// Log standard deviation of the next state, clamped
    pub next_state_log_sigma: Array2<f32>,
    /// Expected reward
    pub reward: Array1<f32>,
    /// Logit of the probability that the episode continues
    pub not_terminal_logit: Array1<f32>,
}

impl WorldModel {
    /// Build a model with the given hidden layers
    pub fn new(
        state_dim: usize,
        action_dim: usize,
        params: &WorldModelParameters,
    ) -> Result<Self> {
        let activations = vec![crate::nn::Activation::Relu; params.hidden_sizes.len()];
        let body = FullyConnectedNetwork::new(
            state_dim + action_dim,
            &params.hidden_sizes,
            &activations,
            2 * state_dim + 2,
        )?;
        Ok(Self {
            body,
            state_dim,
            action_dim,
        })
    }

    /// Width of the normalized state
    #[must_use]
    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    /// Width of the encoded action
    #[must_use]
    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    /// Place parameters on `device`
    pub fn place(&mut self, device: Device) -> Result<()> {
        self.body.place(device)
    }

    /// Predict next-state distribution, reward and continuation
    pub fn forward(&self, state: &Array2<f32>, action: &Array2<f32>) -> Result<WorldModelOutput> {
        let raw = self.body.forward(&self.join(state, action)?)?;
        Ok(self.split(&raw))
    }

    fn join(&self, state: &Array2<f32>, action: &Array2<f32>) -> Result<Array2<f32>> {
        if state.ncols() != self.state_dim {
            return Err(RLError::DimensionMismatch {
                expected: self.state_dim,
                actual: state.ncols(),
            });
        }
        if action.ncols() != self.action_dim {
            return Err(RLError::DimensionMismatch {
                expected: self.action_dim,
                actual: action.ncols(),
            });
        }
        Ok(concatenate(Axis(1), &[state.view(), action.view()])?)
    }

    fn split(&self, raw: &Array2<f32>) -> WorldModelOutput {
        let d = self.state_dim;
        WorldModelOutput {
            next_state_mean: raw.slice(s![.., ..d]).to_owned(),
            next_state_log_sigma: raw
                .slice(s![.., d..2 * d])
                .mapv(|v| v.clamp(LOG_SIGMA_MIN, LOG_SIGMA_MAX)),
            reward: raw.column(2 * d).to_owned(),
            not_terminal_logit: raw.column(2 * d + 1).to_owned(),
        }
    }
}

/// Loss components of one world-model step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldModelLosses {
    /// Weighted total
    pub loss: f32,
    /// Not-terminal binary cross-entropy
    pub bce: f32,
    /// Next-state Gaussian negative log-likelihood
    pub gmm: f32,
    /// Reward squared error
    pub mse: f32,
}

/// Trains one [`WorldModel`] and keeps running means of its losses.
///
/// The running means belong to this trainer instance: they accumulate across
/// its steps and start empty for every new trainer.
pub struct WorldModelTrainer {
    model: SharedNetwork<WorldModel>,
    params: WorldModelParameters,
    optimizer: Optimizer,
    minibatch: usize,
    cum_loss: RollingMean,
    cum_bce: RollingMean,
    cum_gmm: RollingMean,
    cum_mse: RollingMean,
    observers: ObserverSet,
}

impl WorldModelTrainer {
    /// Create a trainer for a shared model
    #[must_use]
    pub fn new(model: SharedNetwork<WorldModel>, params: WorldModelParameters) -> Self {
        let window = params.loss_window;
        Self {
            optimizer: Optimizer::new(OptimizerParameters::adam(params.learning_rate)),
            model,
            params,
            minibatch: 0,
            cum_loss: RollingMean::new(window),
            cum_bce: RollingMean::new(window),
            cum_gmm: RollingMean::new(window),
            cum_mse: RollingMean::new(window),
            observers: ObserverSet::new(),
        }
    }

    /// Shared model handle
    #[must_use]
    pub fn model(&self) -> SharedNetwork<WorldModel> {
        self.model.clone()
    }

    /// Running means of `(loss, bce, gmm, mse)`
    #[must_use]
    pub fn running_losses(&self) -> WorldModelLosses {
        WorldModelLosses {
            loss: self.cum_loss.mean(),
            bce: self.cum_bce.mean(),
            gmm: self.cum_gmm.mean(),
            mse: self.cum_mse.mean(),
        }
    }

    /// Check that `batch` is non-empty, row-aligned and as wide as the model
    pub fn check_batch(&self, batch: &MemoryNetworkInput) -> Result<()> {
        if batch.batch_size() == 0 {
            return Err(RLError::Precondition("empty training batch".to_string()));
        }
        batch.check_rows()?;
        let model = read_network(&self.model)?;
        for (expected, actual) in [
            (model.state_dim, batch.state.ncols()),
            (model.action_dim, batch.action.ncols()),
            (model.state_dim, batch.next_state.ncols()),
        ] {
            if expected != actual {
                return Err(RLError::DimensionMismatch { expected, actual });
            }
        }
        Ok(())
    }

    /// One optimizer step on a borrowed batch
    pub fn train_step(&mut self, batch: &MemoryNetworkInput) -> Result<WorldModelLosses> {
        self.check_batch(batch)?;
        let mut model = write_network(&self.model)?;
        let input = model.join(&batch.state, &batch.action)?;
        let (raw, cache) = model.body.forward_with_cache(&input)?;
        let output = model.split(&raw);
        let (losses, grad_raw) = self.losses_and_gradient(&model, &raw, &output, batch)?;
        let (grads, _) = model.body.backward(&cache, &grad_raw)?;
        self.optimizer.step(&mut model.body, grads)?;
        drop(model);

        self.minibatch += 1;
        self.cum_loss.push(losses.loss);
        self.cum_bce.push(losses.bce);
        self.cum_gmm.push(losses.gmm);
        self.cum_mse.push(losses.mse);
        histogram!("rlkit_world_model_loss", f64::from(losses.loss));
        Ok(losses)
    }

    /// Losses on a batch without updating parameters
    pub fn evaluate_losses(&self, batch: &MemoryNetworkInput) -> Result<WorldModelLosses> {
        self.check_batch(batch)?;
        let model = read_network(&self.model)?;
        let input = model.join(&batch.state, &batch.action)?;
        let raw = model.body.forward(&input)?;
        let output = model.split(&raw);
        Ok(self.losses_and_gradient(&model, &raw, &output, batch)?.0)
    }

    #[allow(clippy::cast_precision_loss)]
    fn losses_and_gradient(
        &self,
        model: &WorldModel,
        raw: &Array2<f32>,
        output: &WorldModelOutput,
        batch: &MemoryNetworkInput,
    ) -> Result<(WorldModelLosses, Array2<f32>)> {
        let d = model.state_dim;
        if batch.next_state.ncols() != d {
            return Err(RLError::DimensionMismatch {
                expected: d,
                actual: batch.next_state.ncols(),
            });
        }
        let b = batch.batch_size() as f32;
        let bd = b * d as f32;

        // next-state Gaussian NLL, averaged over rows and dimensions
        let sigma = output.next_state_log_sigma.mapv(f32::exp);
        let z = (&batch.next_state - &output.next_state_mean) / &sigma;
        let nll = z.mapv(|v| 0.5 * v * v) + &output.next_state_log_sigma + 0.5 * (2.0 * PI).ln();
        let gmm = nll.sum() / bd;
        let grad_mean = -(&z / &sigma) / bd;
        let mut grad_log_sigma = z.mapv(|v| (1.0 - v * v) / bd);
        let raw_log_sigma = raw.slice(s![.., d..2 * d]);
        grad_log_sigma.zip_mut_with(&raw_log_sigma, |g, &r| {
            if !(LOG_SIGMA_MIN..=LOG_SIGMA_MAX).contains(&r) {
                *g = 0.0;
            }
        });

        // reward regression
        let reward_error = &output.reward - &batch.reward;
        let mse = reward_error.mapv(|v| v * v).sum() / b;
        let grad_reward = reward_error * (2.0 / b);

        // not-terminal classification from logits
        let logits = &output.not_terminal_logit;
        let bce = logits
            .iter()
            .zip(batch.not_terminal.iter())
            .map(|(&x, &y)| x.max(0.0) - x * y + (-x.abs()).exp().ln_1p())
            .sum::<f32>()
            / b;
        let grad_logit = (logits.mapv(sigmoid) - &batch.not_terminal) / b;

        let w = &self.params;
        let loss = w.next_state_loss_weight * gmm
            + w.reward_loss_weight * mse
            + w.not_terminal_loss_weight * bce;
        let grad_raw = concatenate(
            Axis(1),
            &[
                (grad_mean * w.next_state_loss_weight).view(),
                (grad_log_sigma * w.next_state_loss_weight).view(),
                (grad_reward * w.reward_loss_weight).insert_axis(Axis(1)).view(),
                (grad_logit * w.not_terminal_loss_weight).insert_axis(Axis(1)).view(),
            ],
        )?;

        Ok((WorldModelLosses { loss, bce, gmm, mse }, grad_raw))
    }
}

fn losses_to_metrics(losses: WorldModelLosses, prefix: &str) -> TrainingMetrics {
    let mut metrics = TrainingMetrics::new();
    metrics.insert(format!("{prefix}loss"), losses.loss);
    metrics.insert(format!("{prefix}bce"), losses.bce);
    metrics.insert(format!("{prefix}gmm"), losses.gmm);
    metrics.insert(format!("{prefix}mse"), losses.mse);
    metrics
}

impl Trainer for WorldModelTrainer {
    type Batch = MemoryNetworkInput;

    fn train(&mut self, batch: MemoryNetworkInput) -> Result<TrainingMetrics> {
        let losses = self.train_step(&batch)?;
        let metrics = losses_to_metrics(losses, "");
        debug!(minibatch = self.minibatch, loss = losses.loss, "world model step");
        self.observers.notify_train_step(self.minibatch, &metrics)?;
        Ok(metrics)
    }

    fn evaluate(&self, batch: &MemoryNetworkInput) -> Result<TrainingMetrics> {
        Ok(losses_to_metrics(self.evaluate_losses(batch)?, "eval_"))
    }

    fn minibatch(&self) -> usize {
        self.minibatch
    }

    fn internal_prediction(&self, _state: &Array2<f32>) -> Result<PolicyActionSet> {
        Err(RLError::Unsupported(
            "a world model does not select actions".to_string(),
        ))
    }

    fn internal_reward_estimation(
        &self,
        state: &Array2<f32>,
        action: &Array2<f32>,
    ) -> Result<Array1<f32>> {
        Ok(read_network(&self.model)?.forward(state, action)?.reward)
    }

    fn observers(&self) -> &ObserverSet {
        &self.observers
    }

    fn observers_mut(&mut self) -> &mut ObserverSet {
        &mut self.observers
    }
}
