//! Model heads built on [`FullyConnectedNetwork`]

use ndarray::{concatenate, s, Array1, Array2, Axis};

use rlkit_core::{RLError, Result};

use crate::device::Device;
use crate::nn::{ForwardCache, FullyConnectedNetwork, Gradients};

/// Q(s, ·) over a fixed set of discrete actions.
///
/// The dueling variant emits `[V | A_1..A_n]` and combines them as
/// `Q = V + A - mean(A)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteQNetwork {
    body: FullyConnectedNetwork,
    num_actions: usize,
    dueling: bool,
}

impl DiscreteQNetwork {
    /// Plain Q head, `body` must output one value per action
    pub fn fully_connected(body: FullyConnectedNetwork, num_actions: usize) -> Result<Self> {
        if body.output_dim() != num_actions {
            return Err(RLError::DimensionMismatch {
                expected: num_actions,
                actual: body.output_dim(),
            });
        }
        Ok(Self {
            body,
            num_actions,
            dueling: false,
        })
    }

    /// Dueling head, `body` must output `1 + num_actions` values
    pub fn dueling(body: FullyConnectedNetwork, num_actions: usize) -> Result<Self> {
        if body.output_dim() != num_actions + 1 {
            return Err(RLError::DimensionMismatch {
                expected: num_actions + 1,
                actual: body.output_dim(),
            });
        }
        Ok(Self {
            body,
            num_actions,
            dueling: true,
        })
    }

    /// Number of actions scored
    #[must_use]
    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    /// Width of the normalized state
    #[must_use]
    pub fn state_dim(&self) -> usize {
        self.body.input_dim()
    }

    /// Whether this is a dueling head
    #[must_use]
    pub fn is_dueling(&self) -> bool {
        self.dueling
    }

    /// Underlying network
    #[must_use]
    pub fn body(&self) -> &FullyConnectedNetwork {
        &self.body
    }

    /// Underlying network, for optimizer steps
    pub fn body_mut(&mut self) -> &mut FullyConnectedNetwork {
        &mut self.body
    }

    /// Q-values, shape `(batch, num_actions)`
    pub fn forward(&self, state: &Array2<f32>) -> Result<Array2<f32>> {
        let raw = self.body.forward(state)?;
        Ok(self.combine(raw))
    }

    /// Q-values plus the cache needed by [`Self::backward`]
    pub fn forward_with_cache(&self, state: &Array2<f32>) -> Result<(Array2<f32>, ForwardCache)> {
        let (raw, cache) = self.body.forward_with_cache(state)?;
        Ok((self.combine(raw), cache))
    }

    /// Parameter gradients for dL/dQ
    pub fn backward(&self, cache: &ForwardCache, grad_q: &Array2<f32>) -> Result<Gradients> {
        let grad_raw = if self.dueling {
            let grad_value = grad_q.sum_axis(Axis(1)).insert_axis(Axis(1));
            let mean = grad_q
                .mean_axis(Axis(1))
                .ok_or_else(|| RLError::Computation("empty Q gradient".to_string()))?
                .insert_axis(Axis(1));
            let grad_advantage = grad_q - &mean;
            concatenate(Axis(1), &[grad_value.view(), grad_advantage.view()])?
        } else {
            grad_q.clone()
        };
        Ok(self.body.backward(cache, &grad_raw)?.0)
    }

    /// Polyak-average towards `source`
    pub fn soft_update_from(&mut self, source: &Self, tau: f32) -> Result<()> {
        self.body.soft_update_from(&source.body, tau)
    }

    /// Place parameters on `device`
    pub fn place(&mut self, device: Device) -> Result<()> {
        self.body.place(device)
    }

    #[allow(clippy::cast_precision_loss)]
    fn combine(&self, raw: Array2<f32>) -> Array2<f32> {
        if !self.dueling {
            return raw;
        }
        let value = raw.slice(s![.., 0..1]).to_owned();
        let advantage = raw.slice(s![.., 1..]).to_owned();
        let mean = advantage.sum_axis(Axis(1)).insert_axis(Axis(1)) / self.num_actions.max(1) as f32;
        advantage + &value - &mean
    }
}

/// Q(s, a) for continuous actions, fed `concat(state, action)`
#[derive(Debug, Clone, PartialEq)]
pub struct ParametricQNetwork {
    body: FullyConnectedNetwork,
    state_dim: usize,
    action_dim: usize,
}

impl ParametricQNetwork {
    /// Wrap a body with input `state_dim + action_dim` and output 1
    pub fn new(body: FullyConnectedNetwork, state_dim: usize, action_dim: usize) -> Result<Self> {
        if body.input_dim() != state_dim + action_dim {
            return Err(RLError::DimensionMismatch {
                expected: state_dim + action_dim,
                actual: body.input_dim(),
            });
        }
        if body.output_dim() != 1 {
            return Err(RLError::DimensionMismatch {
                expected: 1,
                actual: body.output_dim(),
            });
        }
        Ok(Self {
            body,
            state_dim,
            action_dim,
        })
    }

    /// Width of the action input
    #[must_use]
    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    /// Underlying network, for optimizer steps
    pub fn body_mut(&mut self) -> &mut FullyConnectedNetwork {
        &mut self.body
    }

    /// Q-values, shape `(batch,)`
    pub fn forward(&self, state: &Array2<f32>, action: &Array2<f32>) -> Result<Array1<f32>> {
        let input = self.join(state, action)?;
        Ok(self.body.forward(&input)?.column(0).to_owned())
    }

    /// Q-values plus the cache needed by [`Self::backward`]
    pub fn forward_with_cache(
        &self,
        state: &Array2<f32>,
        action: &Array2<f32>,
    ) -> Result<(Array1<f32>, ForwardCache)> {
        let input = self.join(state, action)?;
        let (out, cache) = self.body.forward_with_cache(&input)?;
        Ok((out.column(0).to_owned(), cache))
    }

    /// Parameter gradients and dL/d action for dL/dQ
    pub fn backward(
        &self,
        cache: &ForwardCache,
        grad_q: &Array1<f32>,
    ) -> Result<(Gradients, Array2<f32>)> {
        let grad_out = grad_q.clone().insert_axis(Axis(1));
        let (grads, grad_input) = self.body.backward(cache, &grad_out)?;
        let grad_action = grad_input.slice(s![.., self.state_dim..]).to_owned();
        Ok((grads, grad_action))
    }

    /// Polyak-average towards `source`
    pub fn soft_update_from(&mut self, source: &Self, tau: f32) -> Result<()> {
        self.body.soft_update_from(&source.body, tau)
    }

    /// Place parameters on `device`
    pub fn place(&mut self, device: Device) -> Result<()> {
        self.body.place(device)
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
}

/// Gaussian policy head emitting `(loc, scale_log)` per action dimension
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianActor {
    body: FullyConnectedNetwork,
    action_dim: usize,
    log_scale_min: f32,
    log_scale_max: f32,
}

/// Actor outputs kept for the policy-gradient step
#[derive(Debug, Clone)]
pub struct GaussianActorCache {
    cache: ForwardCache,
    raw_scale_log: Array2<f32>,
}

impl GaussianActor {
    /// Wrap a body with output `2 * action_dim`
    pub fn new(
        body: FullyConnectedNetwork,
        action_dim: usize,
        log_scale_min: f32,
        log_scale_max: f32,
    ) -> Result<Self> {
        if body.output_dim() != 2 * action_dim {
            return Err(RLError::DimensionMismatch {
                expected: 2 * action_dim,
                actual: body.output_dim(),
            });
        }
        if log_scale_min >= log_scale_max {
            return Err(RLError::Configuration(format!(
                "log scale bounds ({log_scale_min}, {log_scale_max}) are inverted"
            )));
        }
        Ok(Self {
            body,
            action_dim,
            log_scale_min,
            log_scale_max,
        })
    }

    /// Width of one action
    #[must_use]
    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    /// Width of the normalized state
    #[must_use]
    pub fn state_dim(&self) -> usize {
        self.body.input_dim()
    }

    /// Underlying network, for optimizer steps
    pub fn body_mut(&mut self) -> &mut FullyConnectedNetwork {
        &mut self.body
    }

    /// Location and clamped log-scale, each `(batch, action_dim)`
    pub fn forward(&self, state: &Array2<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        let raw = self.body.forward(state)?;
        let (loc, scale_log) = self.split(&raw);
        Ok((loc, self.clamp(&scale_log)))
    }

    /// Forward pass keeping the cache for [`Self::backward`]
    pub fn forward_with_cache(
        &self,
        state: &Array2<f32>,
    ) -> Result<(Array2<f32>, Array2<f32>, GaussianActorCache)> {
        let (raw, cache) = self.body.forward_with_cache(state)?;
        let (loc, raw_scale_log) = self.split(&raw);
        let scale_log = self.clamp(&raw_scale_log);
        Ok((
            loc,
            scale_log,
            GaussianActorCache {
                cache,
                raw_scale_log,
            },
        ))
    }

    /// Parameter gradients for dL/d loc and dL/d scale_log.
    ///
    /// Clamped log-scales receive no gradient.
    pub fn backward(
        &self,
        cache: &GaussianActorCache,
        grad_loc: &Array2<f32>,
        grad_scale_log: &Array2<f32>,
    ) -> Result<Gradients> {
        let (min, max) = (self.log_scale_min, self.log_scale_max);
        let mut grad_scale_log = grad_scale_log.clone();
        grad_scale_log.zip_mut_with(&cache.raw_scale_log, |g, &raw| {
            if raw < min || raw > max {
                *g = 0.0;
            }
        });
        let grad_out = concatenate(Axis(1), &[grad_loc.view(), grad_scale_log.view()])?;
        Ok(self.body.backward(&cache.cache, &grad_out)?.0)
    }

    /// Place parameters on `device`
    pub fn place(&mut self, device: Device) -> Result<()> {
        self.body.place(device)
    }

    fn split(&self, raw: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
        (
            raw.slice(s![.., ..self.action_dim]).to_owned(),
            raw.slice(s![.., self.action_dim..]).to_owned(),
        )
    }

    fn clamp(&self, scale_log: &Array2<f32>) -> Array2<f32> {
        scale_log.mapv(|v| v.clamp(self.log_scale_min, self.log_scale_max))
    }
}

/// State-value network V(s), a body with a single output
pub type ValueNetwork = FullyConnectedNetwork;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Activation;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn dueling_advantages_are_mean_centred() {
        let body = FullyConnectedNetwork::new(3, &[8], &[Activation::Relu], 5).unwrap();
        let q = DiscreteQNetwork::dueling(body.clone(), 4).unwrap();
        let state = arr2(&[[0.1, 0.2, 0.3], [1.0, -1.0, 0.5]]);
        let raw = body.forward(&state).unwrap();
        let values = q.forward(&state).unwrap();
        for (row, raw_row) in values.rows().into_iter().zip(raw.rows()) {
            assert_abs_diff_eq!(row.mean().unwrap(), raw_row[0], epsilon = 1e-5);
        }
    }

    #[test]
    fn dueling_backward_matches_finite_differences() {
        let body = FullyConnectedNetwork::new(2, &[6], &[Activation::Tanh], 4).unwrap();
        let q = DiscreteQNetwork::dueling(body, 3).unwrap();
        let state = arr2(&[[0.4, -0.3]]);
        let weights = arr2(&[[1.0, -2.0, 0.5]]);
        let (_, cache) = q.forward_with_cache(&state).unwrap();
        let grads = q.backward(&cache, &weights).unwrap();

        let loss = |net: &DiscreteQNetwork| (net.forward(&state).unwrap() * &weights).sum();
        let eps = 1e-3;
        let mut perturbed = q.clone();
        perturbed.body_mut().layers_mut()[1].bias[2] += eps;
        let numeric = (loss(&perturbed) - loss(&q)) / eps;
        assert_abs_diff_eq!(grads.biases[1][2], numeric, epsilon = 1e-2);
    }

    #[test]
    fn parametric_q_checks_action_width() {
        let body = FullyConnectedNetwork::new(3, &[4], &[Activation::Relu], 1).unwrap();
        let q = ParametricQNetwork::new(body, 2, 1).unwrap();
        assert!(q.forward(&Array2::zeros((2, 2)), &Array2::zeros((2, 2))).is_err());
        assert_eq!(q.forward(&Array2::zeros((2, 2)), &Array2::zeros((2, 1))).unwrap().len(), 2);
    }

    #[test]
    fn actor_clamps_log_scale() {
        let body = FullyConnectedNetwork::new(2, &[4], &[Activation::Relu], 2).unwrap();
        let actor = GaussianActor::new(body, 1, -0.01, 0.01).unwrap();
        let (_, scale_log) = actor.forward(&arr2(&[[10.0, -10.0]])).unwrap();
        assert!(scale_log.iter().all(|v| (-0.01..=0.01).contains(v)));
    }
}
