//! Soft Actor-Critic trainer

use std::f32::consts::PI;
use std::sync::Mutex;

use metrics::counter;
use ndarray::{Array1, Array2, Axis, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::debug;

use rlkit_core::{PolicyActionSet, RLError, Result, SacPolicyActionSet, TrainingMetrics};

use crate::models::{GaussianActor, ParametricQNetwork, ValueNetwork};
use crate::optimizer::Optimizer;
use crate::parameters::SacTrainerParameters;
use crate::trainer::{read_network, write_network, ObserverSet, SharedNetwork, Trainer};
use crate::types::{PolicyNetworkInput, TrainingBatch};

/// A critic together with its target copy and optimizer
struct Critic {
    network: ParametricQNetwork,
    target: ParametricQNetwork,
    optimizer: Optimizer,
}

/// A state-value network together with its target copy and optimizer
struct ValueCritic {
    network: ValueNetwork,
    target: ValueNetwork,
    optimizer: Optimizer,
}

/// Networks a [`SacTrainer`] is built from
pub struct SacNetworks {
    /// Gaussian policy, shared with exploration policies
    pub actor: SharedNetwork<GaussianActor>,
    /// First critic
    pub q1: ParametricQNetwork,
    /// Optional twin critic
    pub q2: Option<ParametricQNetwork>,
    /// Optional state-value network
    pub value: Option<ValueNetwork>,
}

/// Soft Actor-Critic.
///
/// Each step regresses the critics to `r + γ^k · (1 - done) · V'(s')`, where
/// `V'` is the target value network when one is configured and
/// `min(Q1', Q2')(s', a') - α log π(a'|s')` otherwise. The actor then follows
/// the reparameterised gradient of `α log π - min(Q1, Q2)`, the value network
/// (if any) regresses to `min(Q1, Q2) - α log π`, and every target network is
/// Polyak-averaged.
pub struct SacTrainer {
    params: SacTrainerParameters,
    actor: SharedNetwork<GaussianActor>,
    actor_optimizer: Optimizer,
    q1: Critic,
    q2: Option<Critic>,
    value: Option<ValueCritic>,
    rng: Mutex<StdRng>,
    minibatch: usize,
    observers: ObserverSet,
}

/// Reparameterised sample `a = loc + exp(scale_log) · ε`
struct ActorSample {
    action: Array2<f32>,
    log_prob: Array1<f32>,
}

fn gaussian_log_prob(noise: &Array2<f32>, scale_log: &Array2<f32>) -> Array1<f32> {
    let mut per_dim = Array2::<f32>::zeros(noise.raw_dim());
    Zip::from(&mut per_dim)
        .and(noise)
        .and(scale_log)
        .for_each(|out, &eps, &log_std| *out = -0.5 * eps * eps - log_std - 0.5 * (2.0 * PI).ln());
    per_dim.sum_axis(Axis(1))
}

impl SacTrainer {
    /// Create a trainer; critics and the value network are copied into
    /// freshly initialised target networks
    pub fn new(networks: SacNetworks, params: SacTrainerParameters) -> Result<Self> {
        let action_dim = read_network(&networks.actor)?.action_dim();
        for q in std::iter::once(&networks.q1).chain(networks.q2.as_ref()) {
            if q.action_dim() != action_dim {
                return Err(RLError::DimensionMismatch {
                    expected: action_dim,
                    actual: q.action_dim(),
                });
            }
        }
        if let Some(value) = &networks.value {
            if value.output_dim() != 1 {
                return Err(RLError::DimensionMismatch {
                    expected: 1,
                    actual: value.output_dim(),
                });
            }
        }

        let critic = |network: ParametricQNetwork| Critic {
            target: network.clone(),
            network,
            optimizer: Optimizer::new(params.q_network_optimizer.clone()),
        };
        let q1 = critic(networks.q1);
        let q2 = networks.q2.map(critic);
        let value = networks.value.map(|network| ValueCritic {
            target: network.clone(),
            network,
            optimizer: Optimizer::new(params.value_network_optimizer.clone()),
        });

        Ok(Self {
            actor_optimizer: Optimizer::new(params.actor_network_optimizer.clone()),
            actor: networks.actor,
            q1,
            q2,
            value,
            rng: Mutex::new(StdRng::from_entropy()),
            minibatch: 0,
            observers: ObserverSet::new(),
            params,
        })
    }

    /// Live actor handle
    #[must_use]
    pub fn actor(&self) -> SharedNetwork<GaussianActor> {
        self.actor.clone()
    }

    /// Whether twin critics are in use
    #[must_use]
    pub fn uses_twin_critics(&self) -> bool {
        self.q2.is_some()
    }

    /// Whether a state-value network is in use
    #[must_use]
    pub fn uses_value_network(&self) -> bool {
        self.value.is_some()
    }

    fn sample(&self, actor: &GaussianActor, state: &Array2<f32>) -> Result<ActorSample> {
        let (loc, scale_log) = actor.forward(state)?;
        let noise = self.standard_normal(loc.raw_dim())?;
        let action = &loc + &(scale_log.mapv(f32::exp) * &noise);
        let log_prob = gaussian_log_prob(&noise, &scale_log);
        Ok(ActorSample { action, log_prob })
    }

    fn standard_normal(&self, dim: ndarray::Ix2) -> Result<Array2<f32>> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| RLError::Computation("sampler lock poisoned".to_string()))?;
        Ok(Array2::from_shape_simple_fn(dim, || rng.sample(StandardNormal)))
    }

    /// Element-wise min over the online critics, plus which critic won
    fn min_q(&self, state: &Array2<f32>, action: &Array2<f32>) -> Result<(Array1<f32>, Array1<bool>)> {
        let q1 = self.q1.network.forward(state, action)?;
        match &self.q2 {
            Some(q2) => {
                let q2 = q2.network.forward(state, action)?;
                let first = Zip::from(&q1).and(&q2).map_collect(|a, b| a <= b);
                Ok((Zip::from(&q1).and(&q2).map_collect(|a, b| a.min(*b)), first))
            }
            None => {
                let first = Array1::from_elem(q1.len(), true);
                Ok((q1, first))
            }
        }
    }

    fn bootstrap_targets(&self, actor: &GaussianActor, batch: &PolicyNetworkInput) -> Result<Array1<f32>> {
        let next_value = if let Some(value) = &self.value {
            value.target.forward(&batch.next_state)?.column(0).to_owned()
        } else {
            let next = self.sample(actor, &batch.next_state)?;
            let q1 = self.q1.target.forward(&batch.next_state, &next.action)?;
            let q_min = match &self.q2 {
                Some(q2) => {
                    let q2 = q2.target.forward(&batch.next_state, &next.action)?;
                    Zip::from(&q1).and(&q2).map_collect(|a, b| a.min(*b))
                }
                None => q1,
            };
            q_min - &(next.log_prob * self.params.entropy_temperature)
        };
        let gamma = self.params.rl.gamma;
        let discount = batch.step.mapv(|step| gamma.powf(step));
        Ok(&batch.reward + &(&batch.not_terminal * &discount * &next_value))
    }

    fn check_batch(&self, batch: &PolicyNetworkInput) -> Result<()> {
        if batch.batch_size() == 0 {
            return Err(RLError::Precondition("empty training batch".to_string()));
        }
        batch.check_rows()?;
        let action_dim = self.q1.network.action_dim();
        if batch.action.ncols() != action_dim {
            return Err(RLError::DimensionMismatch {
                expected: action_dim,
                actual: batch.action.ncols(),
            });
        }
        Ok(())
    }
}

fn regress(critic: &mut Critic, batch: &PolicyNetworkInput, target: &Array1<f32>) -> Result<f32> {
    #[allow(clippy::cast_precision_loss)]
    let scale = 2.0 / batch.batch_size() as f32;
    let (q, cache) = critic.network.forward_with_cache(&batch.state, &batch.action)?;
    let error = &q - target;
    let loss = error.mapv(|v| v * v).mean().unwrap_or(0.0);
    let (grads, _) = critic.network.backward(&cache, &(error * scale))?;
    critic.optimizer.step(critic.network.body_mut(), grads)?;
    Ok(loss)
}

impl Trainer for SacTrainer {
    type Batch = PolicyNetworkInput;

    #[allow(clippy::cast_precision_loss)]
    fn train(&mut self, batch: PolicyNetworkInput) -> Result<TrainingMetrics> {
        self.check_batch(&batch)?;
        let batch_size = batch.batch_size() as f32;
        let alpha = self.params.entropy_temperature;
        let mut metrics = TrainingMetrics::new();

        // critics
        let target = {
            let actor = read_network(&self.actor)?;
            self.bootstrap_targets(&actor, &batch)?
        };
        metrics.insert("q1_loss".to_string(), regress(&mut self.q1, &batch, &target)?);
        if let Some(q2) = &mut self.q2 {
            metrics.insert("q2_loss".to_string(), regress(q2, &batch, &target)?);
        }

        // actor
        let mut actor = write_network(&self.actor)?;
        let (loc, scale_log, actor_cache) = actor.forward_with_cache(&batch.state)?;
        let noise = self.standard_normal(loc.raw_dim())?;
        let std = scale_log.mapv(f32::exp);
        let action = &loc + &(&std * &noise);
        let log_prob = gaussian_log_prob(&noise, &scale_log);

        let (q_min, first_wins) = self.min_q(&batch.state, &action)?;
        let (_, q1_cache) = self.q1.network.forward_with_cache(&batch.state, &action)?;
        let q1_weight = first_wins.mapv(|w| if w { 1.0 } else { 0.0 });
        let (_, mut dq_da) = self.q1.network.backward(&q1_cache, &q1_weight)?;
        if let Some(q2) = &self.q2 {
            let (_, q2_cache) = q2.network.forward_with_cache(&batch.state, &action)?;
            let q2_weight = q1_weight.mapv(|w| 1.0 - w);
            dq_da += &q2.network.backward(&q2_cache, &q2_weight)?.1;
        }

        let actor_loss = (&log_prob * alpha - &q_min).mean().unwrap_or(0.0);
        let grad_action = dq_da * (-1.0 / batch_size);
        let grad_scale_log = &grad_action * &std * &noise - alpha / batch_size;
        let grads = actor.backward(&actor_cache, &grad_action, &grad_scale_log)?;
        self.actor_optimizer.step(actor.body_mut(), grads)?;
        drop(actor);
        metrics.insert("actor_loss".to_string(), actor_loss);
        metrics.insert("mean_entropy".to_string(), -log_prob.mean().unwrap_or(0.0));
        metrics.insert("mean_q".to_string(), q_min.mean().unwrap_or(0.0));

        // value
        if let Some(value) = &mut self.value {
            let value_target = &q_min - &(&log_prob * alpha);
            let (v, cache) = value.network.forward_with_cache(&batch.state)?;
            let error = v.column(0).to_owned() - &value_target;
            let loss = error.mapv(|e| e * e).mean().unwrap_or(0.0);
            let grad = (error * (2.0 / batch_size)).insert_axis(Axis(1));
            let (grads, _) = value.network.backward(&cache, &grad)?;
            value.optimizer.step(&mut value.network, grads)?;
            metrics.insert("value_loss".to_string(), loss);
        }

        // targets
        let tau = if self.minibatch < self.params.rl.reward_burnin {
            1.0
        } else {
            self.params.rl.target_update_rate
        };
        for critic in std::iter::once(&mut self.q1).chain(self.q2.as_mut()) {
            critic.target.soft_update_from(&critic.network, tau)?;
        }
        if let Some(value) = &mut self.value {
            value.target.soft_update_from(&value.network, tau)?;
        }

        self.minibatch += 1;
        counter!("rlkit_sac_minibatches_total", 1);
        debug!(
            minibatch = self.minibatch,
            q1_loss = metrics["q1_loss"],
            actor_loss,
            "SAC training step"
        );
        self.observers.notify_train_step(self.minibatch, &metrics)?;
        Ok(metrics)
    }

    fn evaluate(&self, batch: &PolicyNetworkInput) -> Result<TrainingMetrics> {
        self.check_batch(batch)?;
        let actor = read_network(&self.actor)?;
        let target = self.bootstrap_targets(&actor, batch)?;
        let (loc, _) = actor.forward(&batch.state)?;
        drop(actor);

        let q = self.q1.network.forward(&batch.state, &batch.action)?;
        let td = &q - &target;
        let action_error = (&loc - &batch.action).mapv(|v| v * v);

        let mut metrics = TrainingMetrics::new();
        metrics.insert("eval_td_loss".to_string(), td.mapv(|v| v * v).mean().unwrap_or(0.0));
        metrics.insert("eval_action_mse".to_string(), action_error.mean().unwrap_or(0.0));
        metrics.insert("eval_mean_q".to_string(), q.mean().unwrap_or(0.0));
        Ok(metrics)
    }

    fn minibatch(&self) -> usize {
        self.minibatch
    }

    fn internal_prediction(&self, state: &Array2<f32>) -> Result<PolicyActionSet> {
        let (loc, _) = read_network(&self.actor)?.forward(state)?;
        Ok(PolicyActionSet::Sac(SacPolicyActionSet {
            greedy: loc,
            greedy_propensity: 1.0,
        }))
    }

    fn internal_reward_estimation(
        &self,
        state: &Array2<f32>,
        action: &Array2<f32>,
    ) -> Result<Array1<f32>> {
        let _ = (state, action);
        Err(RLError::Unsupported(
            "SAC learns no reward model".to_string(),
        ))
    }

    fn observers(&self) -> &ObserverSet {
        &self.observers
    }

    fn observers_mut(&mut self) -> &mut ObserverSet {
        &mut self.observers
    }
}
