//! Deep Q-Network trainer over a discrete action set

use metrics::{counter, histogram};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use tracing::debug;

use rlkit_core::{DqnPolicyActionSet, PolicyActionSet, RLError, Result, TrainingMetrics};

use crate::models::DiscreteQNetwork;
use crate::optimizer::Optimizer;
use crate::parameters::DqnTrainerParameters;
use crate::preprocessing::argmax;
use crate::trainer::{read_network, write_network, ObserverSet, SharedNetwork, Trainer};
use crate::types::{DiscreteDqnInput, TrainingBatch};
use crate::utils::{sample_categorical, softmax};

/// DQN with a Polyak-averaged target network.
///
/// Targets bootstrap from the masked max of the next Q-values (or the logged
/// next action when `maxq_learning` is off). With double Q-learning the online
/// network picks the next action and the target network scores it. During
/// the first `reward_burnin` minibatches the target is hard-copied.
pub struct DqnTrainer {
    params: DqnTrainerParameters,
    q_network: SharedNetwork<DiscreteQNetwork>,
    q_network_target: DiscreteQNetwork,
    optimizer: Optimizer,
    minibatch: usize,
    observers: ObserverSet,
}

impl DqnTrainer {
    /// Create a trainer around a shared Q-network
    pub fn new(
        q_network: SharedNetwork<DiscreteQNetwork>,
        params: DqnTrainerParameters,
    ) -> Result<Self> {
        let q_network_target = read_network(&q_network)?.clone();
        if !params.actions.is_empty() && params.actions.len() != q_network_target.num_actions() {
            return Err(RLError::DimensionMismatch {
                expected: params.actions.len(),
                actual: q_network_target.num_actions(),
            });
        }
        let optimizer = Optimizer::new(params.optimizer.clone());
        Ok(Self {
            params,
            q_network,
            q_network_target,
            optimizer,
            minibatch: 0,
            observers: ObserverSet::new(),
        })
    }

    /// Live Q-network handle
    #[must_use]
    pub fn q_network(&self) -> SharedNetwork<DiscreteQNetwork> {
        self.q_network.clone()
    }

    /// Trainer configuration
    #[must_use]
    pub fn parameters(&self) -> &DqnTrainerParameters {
        &self.params
    }

    fn check_batch(&self, batch: &DiscreteDqnInput) -> Result<()> {
        let n = self.q_network_target.num_actions();
        for width in [
            batch.action.ncols(),
            batch.next_action.ncols(),
            batch.possible_next_actions_mask.ncols(),
        ] {
            if width != n {
                return Err(RLError::DimensionMismatch {
                    expected: n,
                    actual: width,
                });
            }
        }
        if batch.batch_size() == 0 {
            return Err(RLError::Precondition("empty training batch".to_string()));
        }
        batch.check_rows()
    }

    fn bootstrap_targets(
        &self,
        q_network: &DiscreteQNetwork,
        batch: &DiscreteDqnInput,
    ) -> Result<Array1<f32>> {
        let next_target = self.q_network_target.forward(&batch.next_state)?;
        let next_value: Array1<f32> = if self.params.rl.maxq_learning {
            let selector = if self.params.double_q_learning {
                q_network.forward(&batch.next_state)?
            } else {
                next_target.clone()
            };
            selector
                .rows()
                .into_iter()
                .zip(batch.possible_next_actions_mask.rows())
                .enumerate()
                .map(|(i, (scores, mask))| {
                    masked_argmax(scores, mask).map_or(0.0, |a| next_target[[i, a]])
                })
                .collect()
        } else {
            (&next_target * &batch.next_action).sum_axis(Axis(1))
        };

        let gamma = self.params.rl.gamma;
        let discount = batch.step.mapv(|step| gamma.powf(step));
        Ok(&batch.reward + &(&batch.not_terminal * &discount * &next_value))
    }

    fn action_name(&self, index: usize) -> String {
        self.params
            .actions
            .get(index)
            .cloned()
            .unwrap_or_else(|| index.to_string())
    }
}

fn masked_argmax(scores: ArrayView1<'_, f32>, mask: ArrayView1<'_, f32>) -> Option<usize> {
    scores
        .iter()
        .zip(mask.iter())
        .enumerate()
        .filter(|(_, (_, &m))| m > 0.0)
        .fold(None, |best: Option<(usize, f32)>, (i, (&q, _))| match best {
            Some((_, best_q)) if best_q >= q => best,
            _ => Some((i, q)),
        })
        .map(|(i, _)| i)
}

#[allow(clippy::cast_precision_loss)]
fn action_shares(actions: impl Iterator<Item = usize>, num_actions: usize, batch: usize) -> Vec<f32> {
    let mut counts = vec![0.0; num_actions];
    for a in actions {
        counts[a] += 1.0;
    }
    counts.iter().map(|c| c / batch as f32).collect()
}

impl Trainer for DqnTrainer {
    type Batch = DiscreteDqnInput;

    #[allow(clippy::cast_precision_loss)]
    fn train(&mut self, batch: DiscreteDqnInput) -> Result<TrainingMetrics> {
        self.check_batch(&batch)?;
        let batch_size = batch.batch_size() as f32;

        let mut q_network = write_network(&self.q_network)?;
        let target = self.bootstrap_targets(&q_network, &batch)?;
        let (q_values, cache) = q_network.forward_with_cache(&batch.state)?;
        let q_taken = (&q_values * &batch.action).sum_axis(Axis(1));
        let td = &q_taken - &target;
        let td_loss = td.mapv(|v| v * v).mean().unwrap_or(0.0);

        let grad_q = &batch.action * &(td.insert_axis(Axis(1)) * (2.0 / batch_size));
        let grads = q_network.backward(&cache, &grad_q)?;
        self.optimizer.step(q_network.body_mut(), grads)?;

        let tau = if self.minibatch < self.params.rl.reward_burnin {
            1.0
        } else {
            self.params.rl.target_update_rate
        };
        self.q_network_target.soft_update_from(&q_network, tau)?;
        drop(q_network);

        self.minibatch += 1;

        let mut metrics = TrainingMetrics::new();
        metrics.insert("td_loss".to_string(), td_loss);
        metrics.insert("mean_q".to_string(), q_taken.mean().unwrap_or(0.0));
        metrics.insert("mean_target".to_string(), target.mean().unwrap_or(0.0));
        metrics.insert("mean_reward".to_string(), batch.reward.mean().unwrap_or(0.0));

        counter!("rlkit_dqn_minibatches_total", 1);
        histogram!("rlkit_dqn_td_loss", f64::from(td_loss));
        debug!(minibatch = self.minibatch, td_loss, "DQN training step");

        self.observers.notify_train_step(self.minibatch, &metrics)?;
        Ok(metrics)
    }

    #[allow(clippy::cast_precision_loss)]
    fn evaluate(&self, batch: &DiscreteDqnInput) -> Result<TrainingMetrics> {
        self.check_batch(batch)?;
        let q_network = read_network(&self.q_network)?;
        let target = self.bootstrap_targets(&q_network, batch)?;
        let q_values = q_network.forward(&batch.state)?;
        drop(q_network);

        let q_taken = (&q_values * &batch.action).sum_axis(Axis(1));
        let td = &q_taken - &target;
        let n = self.q_network_target.num_actions();
        let b = batch.batch_size();
        let model = action_shares(q_values.rows().into_iter().map(argmax), n, b);
        let logged = action_shares(batch.action.rows().into_iter().map(argmax), n, b);

        let mut metrics = TrainingMetrics::new();
        metrics.insert("eval_td_loss".to_string(), td.mapv(|v| v * v).mean().unwrap_or(0.0));
        metrics.insert("eval_mean_q".to_string(), q_taken.mean().unwrap_or(0.0));
        for i in 0..n {
            let name = self.action_name(i);
            metrics.insert(format!("model_action_share/{name}"), model[i]);
            metrics.insert(format!("logged_action_share/{name}"), logged[i]);
        }
        Ok(metrics)
    }

    fn minibatch(&self) -> usize {
        self.minibatch
    }

    fn internal_prediction(&self, state: &Array2<f32>) -> Result<PolicyActionSet> {
        let q_values = read_network(&self.q_network)?.forward(state)?;
        let temperature = self.params.rl.temperature;
        let mut rng = rand::thread_rng();
        let greedy = q_values.rows().into_iter().map(argmax).collect();
        let sampled = q_values
            .rows()
            .into_iter()
            .map(|row| sample_categorical(softmax(row, temperature).view(), &mut rng))
            .collect();
        Ok(PolicyActionSet::Dqn(DqnPolicyActionSet {
            greedy,
            softmax: Some(sampled),
        }))
    }

    fn observers(&self) -> &ObserverSet {
        &self.observers
    }

    fn observers_mut(&mut self) -> &mut ObserverSet {
        &mut self.observers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Activation, FullyConnectedNetwork};
    use crate::optimizer::OptimizerParameters;
    use crate::parameters::RlParameters;
    use crate::trainer::share;
    use ndarray::{arr1, arr2};

    fn trainer(maxq_learning: bool) -> DqnTrainer {
        let body = FullyConnectedNetwork::new(2, &[16], &[Activation::Relu], 2).unwrap();
        let q = DiscreteQNetwork::fully_connected(body, 2).unwrap();
        let params = DqnTrainerParameters {
            actions: vec!["L".to_string(), "R".to_string()],
            rl: RlParameters {
                gamma: 0.5,
                maxq_learning,
                ..RlParameters::default()
            },
            optimizer: OptimizerParameters::adam(0.01),
            ..DqnTrainerParameters::default()
        };
        DqnTrainer::new(share(q), params).unwrap()
    }

    // "R" in state 1 pays 1, everything else pays 0, all terminal
    fn batch() -> DiscreteDqnInput {
        DiscreteDqnInput {
            state: arr2(&[[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]]),
            action: arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]]),
            next_state: Array2::zeros((4, 2)),
            next_action: Array2::zeros((4, 2)),
            possible_next_actions_mask: Array2::ones((4, 2)),
            reward: arr1(&[0.0, 1.0, 0.0, 0.0]),
            not_terminal: Array1::zeros(4),
            step: Array1::ones(4),
            action_probability: Array1::ones(4),
        }
    }

    #[test]
    fn td_loss_decreases_and_counter_advances() {
        let mut trainer = trainer(true);
        let first = trainer.train(batch()).unwrap()["td_loss"];
        let mut last = first;
        for _ in 0..300 {
            last = trainer.train(batch()).unwrap()["td_loss"];
        }
        assert!(last < first * 0.2, "{first} -> {last}");
        assert_eq!(trainer.minibatch(), 301);

        let prediction = trainer
            .internal_prediction(&arr2(&[[1.0, 0.0]]))
            .unwrap();
        match prediction {
            PolicyActionSet::Dqn(set) => assert_eq!(set.greedy, vec![1]),
            PolicyActionSet::Sac(_) => panic!("expected a discrete action set"),
        }
    }

    #[test]
    fn misaligned_rows_leave_the_trainer_usable() {
        let mut trainer = trainer(true);
        let mut short = batch();
        short.not_terminal = Array1::zeros(3);
        assert!(matches!(
            trainer.train(short),
            Err(RLError::DimensionMismatch { expected: 4, actual: 3 })
        ));
        assert_eq!(trainer.minibatch(), 0);
        assert!(trainer.train(batch()).is_ok());
        assert_eq!(trainer.minibatch(), 1);
    }

    #[test]
    fn masked_max_ignores_disallowed_actions() {
        let scores = arr1(&[5.0, 1.0, 3.0]);
        let mask = arr1(&[0.0, 1.0, 1.0]);
        assert_eq!(masked_argmax(scores.view(), mask.view()), Some(2));
        assert_eq!(masked_argmax(scores.view(), Array1::zeros(3).view()), None);
    }

    #[test]
    fn sarsa_targets_use_logged_next_action() {
        let trainer = trainer(false);
        let mut batch = batch();
        batch.not_terminal = Array1::ones(4);
        batch.next_action = arr2(&[[1.0, 0.0], [0.0, 0.0], [0.0, 1.0], [1.0, 0.0]]);
        let q = read_network(&trainer.q_network).unwrap().clone();
        let next_q = q.forward(&batch.next_state).unwrap();
        let targets = trainer.bootstrap_targets(&q, &batch).unwrap();
        assert!((targets[0] - 0.5 * next_q[[0, 0]]).abs() < 1e-5);
        assert!((targets[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn evaluate_reports_action_shares() {
        let trainer = trainer(true);
        let metrics = trainer.evaluate(&batch()).unwrap();
        assert!((metrics["logged_action_share/L"] - 0.5).abs() < 1e-6);
        let model_total = metrics["model_action_share/L"] + metrics["model_action_share/R"];
        assert!((model_total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_mismatched_action_width() {
        let mut trainer = trainer(true);
        let mut batch = batch();
        batch.action = Array2::zeros((4, 3));
        assert!(trainer.train(batch).is_err());
        assert_eq!(trainer.minibatch(), 0);
    }
}
