//! Trainer configuration structs

use serde::{Deserialize, Serialize};

use crate::optimizer::OptimizerParameters;

/// Parameters shared by every temporal-difference learner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlParameters {
    /// Discount factor
    pub gamma: f32,
    /// Polyak rate of target-network updates
    pub target_update_rate: f32,
    /// Number of minibatches during which targets are hard-copied
    pub reward_burnin: usize,
    /// Bootstrap from the max next Q-value instead of the logged next action
    pub maxq_learning: bool,
    /// Softmax temperature used by exploration policies
    pub temperature: f32,
    /// Aggregate this many steps into one transition when querying data
    pub multi_steps: Option<u32>,
}

impl Default for RlParameters {
    fn default() -> Self {
        Self {
            gamma: 0.9,
            target_update_rate: 0.001,
            reward_burnin: 1,
            maxq_learning: true,
            temperature: 0.01,
            multi_steps: None,
        }
    }
}

/// Discrete DQN trainer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DqnTrainerParameters {
    /// Action names, in Q-value column order
    pub actions: Vec<String>,
    /// TD-learning parameters
    pub rl: RlParameters,
    /// Select next actions with the online network, evaluate with the target
    pub double_q_learning: bool,
    /// Rows per training batch
    pub minibatch_size: usize,
    /// Q-network optimizer
    pub optimizer: OptimizerParameters,
}

impl Default for DqnTrainerParameters {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            rl: RlParameters::default(),
            double_q_learning: true,
            minibatch_size: 1024,
            optimizer: OptimizerParameters::default(),
        }
    }
}

/// Soft Actor-Critic trainer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SacTrainerParameters {
    /// TD-learning parameters
    pub rl: RlParameters,
    /// Entropy temperature alpha
    pub entropy_temperature: f32,
    /// Rows per training batch
    pub minibatch_size: usize,
    /// Critic optimizer
    pub q_network_optimizer: OptimizerParameters,
    /// Value-network optimizer
    pub value_network_optimizer: OptimizerParameters,
    /// Actor optimizer
    pub actor_network_optimizer: OptimizerParameters,
}

impl Default for SacTrainerParameters {
    fn default() -> Self {
        Self {
            rl: RlParameters {
                target_update_rate: 0.005,
                ..RlParameters::default()
            },
            entropy_temperature: 0.01,
            minibatch_size: 256,
            q_network_optimizer: OptimizerParameters::adam(1e-3),
            value_network_optimizer: OptimizerParameters::adam(1e-3),
            actor_network_optimizer: OptimizerParameters::adam(1e-3),
        }
    }
}

/// Probabilistic world-model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldModelParameters {
    /// Hidden layer sizes
    pub hidden_sizes: Vec<usize>,
    /// Optimizer step size
    pub learning_rate: f32,
    /// Rows per training batch
    pub minibatch_size: usize,
    /// Weight of the next-state Gaussian negative log-likelihood
    pub next_state_loss_weight: f32,
    /// Weight of the reward regression loss
    pub reward_loss_weight: f32,
    /// Weight of the not-terminal classification loss
    pub not_terminal_loss_weight: f32,
    /// Number of recent steps the running loss means cover
    pub loss_window: usize,
}

impl Default for WorldModelParameters {
    fn default() -> Self {
        Self {
            hidden_sizes: vec![64, 64],
            learning_rate: 1e-3,
            minibatch_size: 128,
            next_state_loss_weight: 1.0,
            reward_loss_weight: 1.0,
            not_terminal_loss_weight: 1.0,
            loss_window: 100,
        }
    }
}

/// Cross-entropy-method planning configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CemTrainerParameters {
    /// Planning horizon in steps
    pub plan_horizon_length: usize,
    /// Number of independently trained world models
    pub num_world_models: usize,
    /// Candidate action sequences per CEM iteration
    pub cem_population_size: usize,
    /// CEM refinement iterations
    pub cem_num_iterations: usize,
    /// Rollouts per candidate, each through a randomly drawn world model
    pub ensemble_population_size: usize,
    /// Candidates kept to refit the sampling distribution
    pub num_elites: usize,
    /// Smoothing of the distribution refit, weight of the old distribution
    pub alpha: f32,
    /// Stop refining once every variance falls below this value
    pub epsilon: f32,
    /// World-model configuration
    pub mdnrnn: WorldModelParameters,
    /// Discounting of planned rewards
    pub rl: RlParameters,
}

impl Default for CemTrainerParameters {
    fn default() -> Self {
        Self {
            plan_horizon_length: 10,
            num_world_models: 1,
            cem_population_size: 64,
            cem_num_iterations: 10,
            ensemble_population_size: 1,
            num_elites: 6,
            alpha: 0.25,
            epsilon: 0.001,
            mdnrnn: WorldModelParameters::default(),
            rl: RlParameters::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let params: DqnTrainerParameters =
            serde_json::from_str(r#"{"actions": ["L", "R"], "rl": {"gamma": 0.99}}"#).unwrap();
        assert_eq!(params.actions, vec!["L", "R"]);
        assert!((params.rl.gamma - 0.99).abs() < f32::EPSILON);
        assert!(params.double_q_learning);
        assert_eq!(params.minibatch_size, 1024);
    }

    #[test]
    fn cem_defaults_match_planner_conventions() {
        let params = CemTrainerParameters::default();
        assert!(params.num_elites <= params.cem_population_size);
        assert!(params.alpha > 0.0 && params.alpha < 1.0);
    }
}
