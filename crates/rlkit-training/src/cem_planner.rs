//! Cross-entropy-method planning over an ensemble of world models

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

use rlkit_core::{ContinuousActionRange, RLError, Result};

use crate::nn::sigmoid;
use crate::parameters::CemTrainerParameters;
use crate::trainer::{read_network, share, SharedNetwork};
use crate::utils::sample_categorical;
use crate::world_model::WorldModel;

/// Action sequences the planner searches over
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlannerActions {
    /// Continuous actions inside the training range
    Continuous {
        /// Action dimensions
        action_dim: usize,
        /// Bounds of every dimension
        range: ContinuousActionRange,
    },
    /// One of `num_actions` discrete actions per step, one-hot encoded
    Discrete {
        /// Number of actions
        num_actions: usize,
    },
}

impl PlannerActions {
    /// Width of one encoded action
    #[must_use]
    pub fn action_dim(&self) -> usize {
        match self {
            Self::Continuous { action_dim, .. } => *action_dim,
            Self::Discrete { num_actions } => *num_actions,
        }
    }
}

/// Plans by refining a sampling distribution over action sequences.
///
/// Every candidate sequence is rolled out `ensemble_population_size` times,
/// each time through a randomly drawn world model, and scored by its
/// discounted predicted reward weighted by the predicted continuation
/// probability. The best `num_elites` candidates refit the distribution,
/// smoothed by `alpha` towards the previous one. The first action of the
/// final distribution is returned.
#[derive(Debug, Clone)]
pub struct CemPlannerNetwork {
    world_models: Vec<SharedNetwork<WorldModel>>,
    actions: PlannerActions,
    state_dim: usize,
    plan_horizon_length: usize,
    cem_population_size: usize,
    cem_num_iterations: usize,
    ensemble_population_size: usize,
    num_elites: usize,
    alpha: f32,
    epsilon: f32,
    gamma: f32,
}

impl CemPlannerNetwork {
    /// Create a planner over shared world models
    pub fn new(
        world_models: Vec<SharedNetwork<WorldModel>>,
        params: &CemTrainerParameters,
        actions: PlannerActions,
    ) -> Result<Self> {
        let first = world_models
            .first()
            .ok_or_else(|| RLError::Configuration("planner needs at least one world model".to_string()))?;
        let state_dim = read_network(first)?.state_dim();
        for model in &world_models {
            let model = read_network(model)?;
            if model.state_dim() != state_dim {
                return Err(RLError::DimensionMismatch {
                    expected: state_dim,
                    actual: model.state_dim(),
                });
            }
            if model.action_dim() != actions.action_dim() {
                return Err(RLError::DimensionMismatch {
                    expected: actions.action_dim(),
                    actual: model.action_dim(),
                });
            }
        }
        if params.plan_horizon_length == 0 || params.ensemble_population_size == 0 {
            return Err(RLError::Configuration(
                "plan horizon and ensemble population must be positive".to_string(),
            ));
        }
        if params.num_elites == 0 || params.num_elites > params.cem_population_size {
            return Err(RLError::Configuration(format!(
                "num_elites {} must be in 1..={}",
                params.num_elites, params.cem_population_size
            )));
        }
        if !(0.0..1.0).contains(&params.alpha) {
            return Err(RLError::Configuration(format!(
                "alpha {} must be in [0, 1)",
                params.alpha
            )));
        }

        Ok(Self {
            world_models,
            actions,
            state_dim,
            plan_horizon_length: params.plan_horizon_length,
            cem_population_size: params.cem_population_size,
            cem_num_iterations: params.cem_num_iterations,
            ensemble_population_size: params.ensemble_population_size,
            num_elites: params.num_elites,
            alpha: params.alpha,
            epsilon: params.epsilon,
            gamma: params.rl.gamma,
        })
    }

    /// Number of world models in the ensemble
    #[must_use]
    pub fn num_world_models(&self) -> usize {
        self.world_models.len()
    }

    /// Action sequences searched over
    #[must_use]
    pub fn actions(&self) -> PlannerActions {
        self.actions
    }

    /// Whether the planner emits one-hot discrete actions
    #[must_use]
    pub fn is_discrete(&self) -> bool {
        matches!(self.actions, PlannerActions::Discrete { .. })
    }

    /// Width of the normalized state
    #[must_use]
    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    /// Deep copy whose world models no longer follow training
    pub fn snapshot(&self) -> Result<Self> {
        let world_models = self
            .world_models
            .iter()
            .map(|m| Ok(share(read_network(m)?.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            world_models,
            ..self.clone()
        })
    }

    /// Plan the first action for every normalized state row
    pub fn plan(&self, states: &Array2<f32>) -> Result<Array2<f32>> {
        self.plan_with_rng(states, &mut rand::thread_rng())
    }

    /// [`Self::plan`] with an explicit random source
    pub fn plan_with_rng<R: Rng + ?Sized>(
        &self,
        states: &Array2<f32>,
        rng: &mut R,
    ) -> Result<Array2<f32>> {
        if states.ncols() != self.state_dim {
            return Err(RLError::DimensionMismatch {
                expected: self.state_dim,
                actual: states.ncols(),
            });
        }
        let guards = self
            .world_models
            .iter()
            .map(read_network)
            .collect::<Result<Vec<_>>>()?;
        let models: Vec<&WorldModel> = guards.iter().map(|g| &**g).collect();

        let mut out = Array2::zeros((states.nrows(), self.actions.action_dim()));
        for (state, mut row) in states.rows().into_iter().zip(out.rows_mut()) {
            let action = match self.actions {
                PlannerActions::Continuous { action_dim, range } => {
                    self.plan_continuous(state, action_dim, range, &models, rng)?
                }
                PlannerActions::Discrete { num_actions } => {
                    self.plan_discrete(state, num_actions, &models, rng)?
                }
            };
            row.assign(&action);
        }
        Ok(out)
    }

    #[allow(clippy::cast_precision_loss)]
    fn evaluate<R: Rng + ?Sized>(
        &self,
        state: ArrayView1<'_, f32>,
        actions: &[Array2<f32>],
        models: &[&WorldModel],
        rng: &mut R,
    ) -> Result<Array1<f32>> {
        let population = actions.first().map_or(0, Array2::nrows);
        let mut total = Array1::<f32>::zeros(population);
        for _ in 0..self.ensemble_population_size {
            let model = models[rng.gen_range(0..models.len())];
            let mut current = Array2::from_shape_fn((population, self.state_dim), |(_, j)| state[j]);
            let mut alive = Array1::<f32>::ones(population);
            let mut discount = 1.0;
            for step_actions in actions {
                let prediction = model.forward(&current, step_actions)?;
                total += &(&prediction.reward * &alive * discount);
                alive = alive * prediction.not_terminal_logit.mapv(sigmoid);
                discount *= self.gamma;
                current = prediction.next_state_mean;
            }
        }
        Ok(total / self.ensemble_population_size as f32)
    }

    fn elites(&self, returns: &Array1<f32>) -> Vec<usize> {
        let mut order: Vec<usize> = (0..returns.len()).collect();
        order.sort_by(|&a, &b| returns[b].total_cmp(&returns[a]));
        order.truncate(self.num_elites);
        order
    }

    #[allow(clippy::cast_precision_loss)]
    fn plan_continuous<R: Rng + ?Sized>(
        &self,
        state: ArrayView1<'_, f32>,
        action_dim: usize,
        range: ContinuousActionRange,
        models: &[&WorldModel],
        rng: &mut R,
    ) -> Result<Array1<f32>> {
        let (low, high) = (range.low, range.high);
        let shape = (self.plan_horizon_length, action_dim);
        let mut mean = Array2::from_elem(shape, (low + high) / 2.0);
        let mut var = Array2::from_elem(shape, ((high - low) / 2.0).powi(2));
        let num_elites = self.num_elites as f32;

        for _ in 0..self.cem_num_iterations {
            if var.iter().all(|&v| v < self.epsilon) {
                break;
            }
            let actions: Vec<Array2<f32>> = (0..self.plan_horizon_length)
                .map(|t| {
                    Array2::from_shape_fn((self.cem_population_size, action_dim), |(_, j)| {
                        let noise: f32 = rng.sample(StandardNormal);
                        (mean[[t, j]] + var[[t, j]].sqrt() * noise).clamp(low, high)
                    })
                })
                .collect();
            let returns = self.evaluate(state, &actions, models, rng)?;
            let elites = self.elites(&returns);

            let mut elite_mean = Array2::<f32>::zeros(shape);
            let mut elite_var = Array2::<f32>::zeros(shape);
            for (t, step_actions) in actions.iter().enumerate() {
                let chosen = step_actions.select(Axis(0), &elites);
                let m = chosen.sum_axis(Axis(0)) / num_elites;
                let v = chosen
                    .rows()
                    .into_iter()
                    .fold(Array1::<f32>::zeros(action_dim), |acc, row| {
                        acc + (&row - &m).mapv(|d| d * d)
                    })
                    / num_elites;
                elite_mean.row_mut(t).assign(&m);
                elite_var.row_mut(t).assign(&v);
            }
            mean = mean * self.alpha + elite_mean * (1.0 - self.alpha);
            var = var * self.alpha + elite_var * (1.0 - self.alpha);
        }
        Ok(mean.row(0).to_owned())
    }

    #[allow(clippy::cast_precision_loss)]
    fn plan_discrete<R: Rng + ?Sized>(
        &self,
        state: ArrayView1<'_, f32>,
        num_actions: usize,
        models: &[&WorldModel],
        rng: &mut R,
    ) -> Result<Array1<f32>> {
        let shape = (self.plan_horizon_length, num_actions);
        let mut probs = Array2::from_elem(shape, 1.0 / num_actions as f32);

        for _ in 0..self.cem_num_iterations {
            let mut chosen = Array2::<usize>::zeros((self.plan_horizon_length, self.cem_population_size));
            let actions: Vec<Array2<f32>> = (0..self.plan_horizon_length)
                .map(|t| {
                    let mut one_hot = Array2::zeros((self.cem_population_size, num_actions));
                    for p in 0..self.cem_population_size {
                        let a = sample_categorical(probs.row(t), rng);
                        chosen[[t, p]] = a;
                        one_hot[[p, a]] = 1.0;
                    }
                    one_hot
                })
                .collect();
            let returns = self.evaluate(state, &actions, models, rng)?;
            let elites = self.elites(&returns);

            let mut elite_probs = Array2::<f32>::zeros(shape);
            for t in 0..self.plan_horizon_length {
                for &e in &elites {
                    elite_probs[[t, chosen[[t, e]]]] += 1.0 / self.num_elites as f32;
                }
            }
            probs = probs * self.alpha + elite_probs * (1.0 - self.alpha);
            if probs.row(0).iter().any(|&p| p > 1.0 - self.epsilon) {
                break;
            }
        }

        let best = crate::preprocessing::argmax(probs.row(0));
        let mut action = Array1::zeros(num_actions);
        action[best] = 1.0;
        Ok(action)
    }
}
