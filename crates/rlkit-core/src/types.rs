//! Tensors and records exchanged between policies, trainers and data sources

use std::collections::HashMap;

use indexmap::IndexMap;
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::{RLError, Result};

/// Identifier of a raw input feature
pub type FeatureId = i64;

/// Sparse raw feature values keyed by feature id
pub type RawFeatures = HashMap<FeatureId, f32>;

/// Named scalar metrics produced by one training or evaluation step, in
/// insertion order
pub type TrainingMetrics = IndexMap<String, f32>;

/// Batch of observations fed to a scorer.
///
/// The first axis is the batch axis. A rank-1 tensor has no batch axis and is
/// rejected by every accessor instead of being broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureData {
    /// Dense float features, batch axis first
    pub float_features: ArrayD<f32>,
}

impl FeatureData {
    /// Wrap a tensor of any rank
    #[must_use]
    pub fn new(float_features: ArrayD<f32>) -> Self {
        Self { float_features }
    }

    /// Wrap a `(batch, features)` matrix
    #[must_use]
    pub fn from_batch(batch: Array2<f32>) -> Self {
        Self {
            float_features: batch.into_dyn(),
        }
    }

    /// Stack feature rows into a batch
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let width = rows.first().map_or(0, Vec::len);
        if let Some(row) = rows.iter().find(|r| r.len() != width) {
            return Err(RLError::DimensionMismatch {
                expected: width,
                actual: row.len(),
            });
        }
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Ok(Self::from_batch(Array2::from_shape_vec((rows.len(), width), flat)?))
    }

    /// Number of rows; fails if the batch axis is missing
    pub fn batch_size(&self) -> Result<usize> {
        self.check_rank()?;
        Ok(self.float_features.shape()[0])
    }

    /// Flatten every non-batch axis into a `(batch, features)` matrix
    pub fn to_batch(&self) -> Result<Array2<f32>> {
        self.check_rank()?;
        let shape = self.float_features.shape();
        let batch = shape[0];
        let width: usize = shape[1..].iter().product();
        let contiguous = self.float_features.as_standard_layout().into_owned();
        Ok(contiguous
            .into_shape(IxDyn(&[batch, width]))?
            .into_dimensionality()?)
    }

    fn check_rank(&self) -> Result<()> {
        let rank = self.float_features.ndim();
        if rank < 2 {
            return Err(RLError::Precondition(format!(
                "observation has shape {:?} (dim {rank} < 2)",
                self.float_features.shape()
            )));
        }
        Ok(())
    }
}

/// Output of a policy or sampler invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ActorOutput {
    /// One row per observation: one-hot for discrete actions, values otherwise
    pub action: Array2<f32>,
    /// Log-probability of each sampled row
    pub log_prob: Array1<f32>,
}

/// Discrete action choices predicted by a trainer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DqnPolicyActionSet {
    /// Greedy action index per row
    pub greedy: Vec<usize>,
    /// Softmax-sampled action index per row, when the trainer samples
    pub softmax: Option<Vec<usize>>,
}

/// Continuous action choices predicted by a trainer
#[derive(Debug, Clone, PartialEq)]
pub struct SacPolicyActionSet {
    /// Greedy action per row
    pub greedy: Array2<f32>,
    /// Propensity of the greedy action
    pub greedy_propensity: f32,
}

/// Actions a trainer predicts for direct, non-batched inference
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyActionSet {
    /// Discrete action set
    Dqn(DqnPolicyActionSet),
    /// Continuous action set
    Sac(SacPolicyActionSet),
}

/// Action column of a raw dataset row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawAction {
    /// Named discrete action; the empty name means "no action"
    Discrete(String),
    /// Sparse continuous action features
    Continuous(RawFeatures),
}

impl RawAction {
    /// The "no action" marker used for terminal next actions
    #[must_use]
    pub fn none() -> Self {
        Self::Discrete(String::new())
    }
}

impl Default for RawAction {
    fn default() -> Self {
        Self::none()
    }
}

fn default_step() -> u32 {
    1
}

/// One logged transition as stored in a training table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRow {
    /// Episode identifier
    pub mdp_id: String,
    /// Position of the transition inside its episode
    pub sequence_number: i64,
    /// Raw state features
    pub state_features: RawFeatures,
    /// Action taken
    pub action: RawAction,
    /// Probability the logging policy assigned to the action
    #[serde(default = "one")]
    pub action_probability: f32,
    /// Reward received
    pub reward: f32,
    /// Raw next-state features
    #[serde(default)]
    pub next_state_features: RawFeatures,
    /// Action taken in the next state
    #[serde(default)]
    pub next_action: RawAction,
    /// Actions allowed in the next state; empty means unrestricted
    #[serde(default)]
    pub possible_next_actions: Vec<String>,
    /// Whether the episode ended with this transition
    #[serde(default)]
    pub terminal: bool,
    /// Additional logged metrics
    #[serde(default)]
    pub metrics: HashMap<String, f32>,
    /// Environment steps between state and next state
    #[serde(default = "default_step")]
    pub step: u32,
}

fn one() -> f32 {
    1.0
}
