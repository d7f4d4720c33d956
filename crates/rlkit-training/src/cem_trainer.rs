//! Ensemble world-model trainer behind a CEM planner

use std::sync::Arc;

use metrics::counter;
use ndarray::{Array1, Array2};
use tracing::{debug, info};

use rlkit_core::{
    DqnPolicyActionSet, PolicyActionSet, RLError, Result, SacPolicyActionSet, TrainingMetrics,
};

use crate::cem_planner::CemPlannerNetwork;
use crate::preprocessing::argmax;
use crate::trainer::{ObserverSet, Trainer};
use crate::types::MemoryNetworkInput;
use crate::world_model::{WorldModelLosses, WorldModelTrainer};

/// Trains every world model of a planner's ensemble.
///
/// One call to [`Trainer::train`] runs each sub-trainer once, in order, and
/// counts as a single minibatch whatever the ensemble size. A failing
/// sub-trainer aborts the step before the counter moves.
pub struct CemTrainer {
    planner: Arc<CemPlannerNetwork>,
    world_model_trainers: Vec<WorldModelTrainer>,
    minibatch: usize,
    observers: ObserverSet,
}

impl CemTrainer {
    /// Create a trainer; `world_model_trainers` must train the planner's models
    pub fn new(
        planner: Arc<CemPlannerNetwork>,
        world_model_trainers: Vec<WorldModelTrainer>,
    ) -> Result<Self> {
        if world_model_trainers.len() != planner.num_world_models() {
            return Err(RLError::DimensionMismatch {
                expected: planner.num_world_models(),
                actual: world_model_trainers.len(),
            });
        }
        Ok(Self {
            planner,
            world_model_trainers,
            minibatch: 0,
            observers: ObserverSet::new(),
        })
    }

    /// Planner sharing the trained world models
    #[must_use]
    pub fn planner(&self) -> Arc<CemPlannerNetwork> {
        self.planner.clone()
    }

    /// Per-model sub-trainers
    #[must_use]
    pub fn world_model_trainers(&self) -> &[WorldModelTrainer] {
        &self.world_model_trainers
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean_losses(losses: &[WorldModelLosses]) -> WorldModelLosses {
    let n = losses.len().max(1) as f32;
    let sum = |f: fn(&WorldModelLosses) -> f32| losses.iter().map(f).sum::<f32>() / n;
    WorldModelLosses {
        loss: sum(|l| l.loss),
        bce: sum(|l| l.bce),
        gmm: sum(|l| l.gmm),
        mse: sum(|l| l.mse),
    }
}

impl Trainer for CemTrainer {
    type Batch = MemoryNetworkInput;

    fn train(&mut self, batch: MemoryNetworkInput) -> Result<TrainingMetrics> {
        // every member must accept the batch before any of them steps
        for trainer in &self.world_model_trainers {
            trainer.check_batch(&batch)?;
        }
        let mut metrics = TrainingMetrics::new();
        let mut step_losses = Vec::with_capacity(self.world_model_trainers.len());

        for (i, trainer) in self.world_model_trainers.iter_mut().enumerate() {
            let losses = trainer.train_step(&batch)?;
            let running = trainer.running_losses();
            debug!(
                model = i,
                loss = losses.loss,
                bce = losses.bce,
                gmm = losses.gmm,
                mse = losses.mse,
                cum_loss = running.loss,
                cum_bce = running.bce,
                cum_gmm = running.gmm,
                cum_mse = running.mse,
                "world model {i} step"
            );
            metrics.insert(format!("model_{i}/loss"), losses.loss);
            metrics.insert(format!("model_{i}/cum_loss"), running.loss);
            step_losses.push(losses);
        }

        let mean = mean_losses(&step_losses);
        metrics.insert("loss".to_string(), mean.loss);
        metrics.insert("bce".to_string(), mean.bce);
        metrics.insert("gmm".to_string(), mean.gmm);
        metrics.insert("mse".to_string(), mean.mse);

        self.minibatch += 1;
        counter!("rlkit_cem_minibatches_total", 1);
        if self.minibatch % 100 == 0 {
            info!(minibatch = self.minibatch, loss = mean.loss, "CEM ensemble training");
        }
        self.observers.notify_train_step(self.minibatch, &metrics)?;
        Ok(metrics)
    }

    fn evaluate(&self, batch: &MemoryNetworkInput) -> Result<TrainingMetrics> {
        let losses = self
            .world_model_trainers
            .iter()
            .map(|t| t.evaluate_losses(batch))
            .collect::<Result<Vec<_>>>()?;
        let mean = mean_losses(&losses);
        let mut metrics = TrainingMetrics::new();
        metrics.insert("eval_loss".to_string(), mean.loss);
        metrics.insert("eval_bce".to_string(), mean.bce);
        metrics.insert("eval_gmm".to_string(), mean.gmm);
        metrics.insert("eval_mse".to_string(), mean.mse);
        Ok(metrics)
    }

    fn minibatch(&self) -> usize {
        self.minibatch
    }

    fn internal_prediction(&self, state: &Array2<f32>) -> Result<PolicyActionSet> {
        let actions = self.planner.plan(state)?;
        if self.planner.is_discrete() {
            Ok(PolicyActionSet::Dqn(DqnPolicyActionSet {
                greedy: actions.rows().into_iter().map(argmax).collect(),
                softmax: None,
            }))
        } else {
            Ok(PolicyActionSet::Sac(SacPolicyActionSet {
                greedy: actions,
                greedy_propensity: 1.0,
            }))
        }
    }

    fn internal_reward_estimation(
        &self,
        state: &Array2<f32>,
        action: &Array2<f32>,
    ) -> Result<Array1<f32>> {
        let _ = (state, action);
        Err(RLError::Unsupported(
            "the CEM planner exposes no reward estimate".to_string(),
        ))
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
    use crate::cem_planner::PlannerActions;
    use crate::parameters::{CemTrainerParameters, WorldModelParameters};
    use crate::trainer::share;
    use crate::world_model::WorldModel;
    use ndarray::arr2;
    use rlkit_core::ContinuousActionRange;

    fn params(num_world_models: usize) -> CemTrainerParameters {
        CemTrainerParameters {
            num_world_models,
            plan_horizon_length: 2,
            cem_population_size: 8,
            cem_num_iterations: 2,
            num_elites: 2,
            mdnrnn: WorldModelParameters {
                hidden_sizes: vec![8],
                ..WorldModelParameters::default()
            },
            ..CemTrainerParameters::default()
        }
    }

    fn trainer(num_world_models: usize, actions: PlannerActions) -> CemTrainer {
        let params = params(num_world_models);
        let models: Vec<_> = (0..num_world_models)
            .map(|_| share(WorldModel::new(2, actions.action_dim(), &params.mdnrnn).unwrap()))
            .collect();
        let trainers = models
            .iter()
            .map(|m| WorldModelTrainer::new(m.clone(), params.mdnrnn.clone()))
            .collect();
        let planner = CemPlannerNetwork::new(models, &params, actions).unwrap();
        CemTrainer::new(Arc::new(planner), trainers).unwrap()
    }

    fn continuous() -> PlannerActions {
        PlannerActions::Continuous {
            action_dim: 1,
            range: ContinuousActionRange::default(),
        }
    }

    fn batch(action_dim: usize) -> MemoryNetworkInput {
        MemoryNetworkInput {
            state: arr2(&[[0.0, 1.0], [1.0, 0.0], [0.5, 0.5]]),
            action: Array2::from_elem((3, action_dim), 0.5),
            next_state: arr2(&[[0.1, 1.0], [1.0, 0.1], [0.5, 0.6]]),
            reward: Array1::from_vec(vec![1.0, 0.0, 0.5]),
            not_terminal: Array1::ones(3),
        }
    }

    #[test]
    fn counter_advances_once_per_step_for_any_ensemble_size() {
        for n in [1, 5] {
            let mut trainer = trainer(n, continuous());
            let before = trainer.minibatch();
            let metrics = trainer.train(batch(1)).unwrap();
            assert_eq!(trainer.minibatch() - before, 1, "ensemble of {n}");
            assert!(metrics.contains_key("gmm"));
            assert!(trainer
                .world_model_trainers()
                .iter()
                .all(|t| t.minibatch() == 1));
        }
    }

    #[test]
    fn failing_sub_model_aborts_the_step() {
        let mut trainer = trainer(2, continuous());
        // wrong action width makes every world model fail
        assert!(trainer.train(batch(3)).is_err());
        assert_eq!(trainer.minibatch(), 0);
        assert!(trainer.world_model_trainers().iter().all(|t| t.minibatch() == 0));
    }

    #[test]
    fn misaligned_rows_commit_no_member() {
        let mut trainer = trainer(2, continuous());
        let mut short = batch(1);
        short.reward = Array1::from_vec(vec![1.0, 0.0]);
        assert!(matches!(
            trainer.train(short),
            Err(RLError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert_eq!(trainer.minibatch(), 0);
        assert!(trainer.world_model_trainers().iter().all(|t| t.minibatch() == 0));
        assert!(trainer.world_model_trainers()[0].running_losses().loss.abs() < f32::EPSILON);

        trainer.train(batch(1)).unwrap();
        assert_eq!(trainer.minibatch(), 1);
    }

    #[test]
    fn prediction_matches_planner_kind() {
        let continuous_trainer = trainer(1, continuous());
        let state = arr2(&[[0.2, 0.3]]);
        match continuous_trainer.internal_prediction(&state).unwrap() {
            PolicyActionSet::Sac(set) => {
                assert_eq!(set.greedy.dim(), (1, 1));
                assert!((set.greedy_propensity - 1.0).abs() < f32::EPSILON);
            }
            PolicyActionSet::Dqn(_) => panic!("expected a continuous action set"),
        }

        let discrete_trainer = trainer(1, PlannerActions::Discrete { num_actions: 3 });
        match discrete_trainer.internal_prediction(&state).unwrap() {
            PolicyActionSet::Dqn(set) => assert!(set.greedy[0] < 3),
            PolicyActionSet::Sac(_) => panic!("expected a discrete action set"),
        }
    }

    #[test]
    fn reward_estimation_is_unsupported() {
        let trainer = trainer(1, continuous());
        let err = trainer
            .internal_reward_estimation(&arr2(&[[0.0, 0.0]]), &arr2(&[[0.0]]))
            .unwrap_err();
        assert!(matches!(err, RLError::Unsupported(_)));
    }
}
