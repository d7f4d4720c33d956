//! Inference modules that accept raw, unnormalized features
//!
//! A serving module owns a snapshot of the trained network together with the
//! preprocessing it was trained behind. Later training steps do not affect
//! an already built module.

use ndarray::Array2;

use rlkit_core::{RLError, RawFeatures, Result};

use crate::cem_planner::CemPlannerNetwork;
use crate::models::{DiscreteQNetwork, GaussianActor};
use crate::preprocessing::{argmax, Postprocessor, Preprocessor};

/// Q values for named discrete actions
#[derive(Debug, Clone)]
pub struct DiscreteDqnServingModule {
    action_names: Vec<String>,
    state_preprocessor: Preprocessor,
    q_network: DiscreteQNetwork,
}

impl DiscreteDqnServingModule {
    /// Bundle a Q network snapshot with its state preprocessing
    pub fn new(
        action_names: Vec<String>,
        state_preprocessor: Preprocessor,
        q_network: DiscreteQNetwork,
    ) -> Result<Self> {
        if action_names.len() != q_network.num_actions() {
            return Err(RLError::DimensionMismatch {
                expected: q_network.num_actions(),
                actual: action_names.len(),
            });
        }
        check_state_width(&state_preprocessor, q_network.state_dim())?;
        Ok(Self {
            action_names,
            state_preprocessor,
            q_network,
        })
    }

    /// Action names in output column order
    #[must_use]
    pub fn action_names(&self) -> &[String] {
        &self.action_names
    }

    /// Number of raw state features expected per row
    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.state_preprocessor.input_dim()
    }

    /// Q values for raw dense states in feature-id order
    pub fn q_values(&self, raw_state: &Array2<f32>) -> Result<Array2<f32>> {
        let state = self.state_preprocessor.transform(raw_state)?;
        self.q_network.forward(&state)
    }

    /// Q values for sparse raw states
    pub fn q_values_sparse(&self, rows: &[RawFeatures]) -> Result<Array2<f32>> {
        let state = self.state_preprocessor.transform_sparse(rows)?;
        self.q_network.forward(&state)
    }

    /// Name of the highest-valued action per row
    pub fn greedy_actions(&self, raw_state: &Array2<f32>) -> Result<Vec<String>> {
        let q = self.q_values(raw_state)?;
        Ok(q
            .rows()
            .into_iter()
            .map(|row| self.action_names[argmax(row)].clone())
            .collect())
    }
}

/// Deterministic continuous actions in environment units
#[derive(Debug, Clone)]
pub struct ActorServingModule {
    state_preprocessor: Preprocessor,
    actor: GaussianActor,
    action_postprocessor: Postprocessor,
}

impl ActorServingModule {
    /// Bundle an actor snapshot with state preprocessing and action
    /// postprocessing
    pub fn new(
        state_preprocessor: Preprocessor,
        actor: GaussianActor,
        action_postprocessor: Postprocessor,
    ) -> Result<Self> {
        check_state_width(&state_preprocessor, actor.state_dim())?;
        if action_postprocessor.action_dim() != actor.action_dim() {
            return Err(RLError::DimensionMismatch {
                expected: actor.action_dim(),
                actual: action_postprocessor.action_dim(),
            });
        }
        Ok(Self {
            state_preprocessor,
            actor,
            action_postprocessor,
        })
    }

    /// Number of raw state features expected per row
    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.state_preprocessor.input_dim()
    }

    /// Width of one action
    #[must_use]
    pub fn action_dim(&self) -> usize {
        self.actor.action_dim()
    }

    /// Mean action for raw dense states, mapped back to action bounds
    pub fn act(&self, raw_state: &Array2<f32>) -> Result<Array2<f32>> {
        let state = self.state_preprocessor.transform(raw_state)?;
        let (loc, _) = self.actor.forward(&state)?;
        self.action_postprocessor.transform(&loc)
    }
}

/// First planned action for raw states
#[derive(Debug, Clone)]
pub struct CemPlannerServingModule {
    state_preprocessor: Preprocessor,
    planner: CemPlannerNetwork,
    action_postprocessor: Option<Postprocessor>,
}

impl CemPlannerServingModule {
    /// Snapshot the planner's world models; continuous planners need an
    /// action postprocessor, discrete ones emit one-hot rows as is
    pub fn new(
        state_preprocessor: Preprocessor,
        planner: &CemPlannerNetwork,
        action_postprocessor: Option<Postprocessor>,
    ) -> Result<Self> {
        check_state_width(&state_preprocessor, planner.state_dim())?;
        match (&action_postprocessor, planner.is_discrete()) {
            (None, false) => {
                return Err(RLError::Configuration(
                    "continuous planner needs an action postprocessor".to_string(),
                ))
            }
            (Some(_), true) => {
                return Err(RLError::Configuration(
                    "discrete planner emits one-hot actions and takes no postprocessor"
                        .to_string(),
                ))
            }
            _ => {}
        }
        Ok(Self {
            state_preprocessor,
            planner: planner.snapshot()?,
            action_postprocessor,
        })
    }

    /// Whether the planner picks among discrete actions
    #[must_use]
    pub fn is_discrete(&self) -> bool {
        self.planner.is_discrete()
    }

    /// Plan from raw dense states
    pub fn plan(&self, raw_state: &Array2<f32>) -> Result<Array2<f32>> {
        let state = self.state_preprocessor.transform(raw_state)?;
        let actions = self.planner.plan(&state)?;
        match &self.action_postprocessor {
            Some(post) => post.transform(&actions),
            None => Ok(actions),
        }
    }
}

fn check_state_width(preprocessor: &Preprocessor, network_dim: usize) -> Result<()> {
    if preprocessor.output_dim() == network_dim {
        Ok(())
    } else {
        Err(RLError::DimensionMismatch {
            expected: network_dim,
            actual: preprocessor.output_dim(),
        })
    }
}
