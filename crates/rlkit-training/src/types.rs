//! Preprocessed training batches, one layout per trainer family

use ndarray::{Array1, Array2};

use rlkit_core::{RLError, Result};

/// Common view over a preprocessed batch
pub trait TrainingBatch {
    /// Number of rows
    fn batch_size(&self) -> usize;

    /// Fails with [`RLError::DimensionMismatch`] unless every field has
    /// `batch_size()` rows
    fn check_rows(&self) -> Result<()>;
}

fn rows_match(expected: usize, rows: &[usize]) -> Result<()> {
    match rows.iter().find(|&&actual| actual != expected) {
        Some(&actual) => Err(RLError::DimensionMismatch { expected, actual }),
        None => Ok(()),
    }
}

/// Batch layout consumed by the discrete DQN trainer
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteDqnInput {
    /// Normalized states
    pub state: Array2<f32>,
    /// One-hot logged actions
    pub action: Array2<f32>,
    /// Normalized next states
    pub next_state: Array2<f32>,
    /// One-hot next actions; all-zero rows mean "no next action"
    pub next_action: Array2<f32>,
    /// 1 where the action is allowed in the next state
    pub possible_next_actions_mask: Array2<f32>,
    /// Rewards
    pub reward: Array1<f32>,
    /// 0 for terminal transitions, 1 otherwise
    pub not_terminal: Array1<f32>,
    /// Environment steps between state and next state
    pub step: Array1<f32>,
    /// Propensity of the logged action
    pub action_probability: Array1<f32>,
}

impl TrainingBatch for DiscreteDqnInput {
    fn batch_size(&self) -> usize {
        self.state.nrows()
    }

    fn check_rows(&self) -> Result<()> {
        rows_match(
            self.batch_size(),
            &[
                self.action.nrows(),
                self.next_state.nrows(),
                self.next_action.nrows(),
                self.possible_next_actions_mask.nrows(),
                self.reward.len(),
                self.not_terminal.len(),
                self.step.len(),
                self.action_probability.len(),
            ],
        )
    }
}

/// Batch layout consumed by actor-critic trainers
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyNetworkInput {
    /// Normalized states
    pub state: Array2<f32>,
    /// Logged actions scaled into the training action range
    pub action: Array2<f32>,
    /// Normalized next states
    pub next_state: Array2<f32>,
    /// Rewards
    pub reward: Array1<f32>,
    /// 0 for terminal transitions, 1 otherwise
    pub not_terminal: Array1<f32>,
    /// Environment steps between state and next state
    pub step: Array1<f32>,
    /// Propensity of the logged action
    pub action_probability: Array1<f32>,
}

impl TrainingBatch for PolicyNetworkInput {
    fn batch_size(&self) -> usize {
        self.state.nrows()
    }

    fn check_rows(&self) -> Result<()> {
        rows_match(
            self.batch_size(),
            &[
                self.action.nrows(),
                self.next_state.nrows(),
                self.reward.len(),
                self.not_terminal.len(),
                self.step.len(),
                self.action_probability.len(),
            ],
        )
    }
}

/// Batch layout consumed by world-model trainers
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryNetworkInput {
    /// Normalized states
    pub state: Array2<f32>,
    /// One-hot discrete or scaled continuous actions
    pub action: Array2<f32>,
    /// Normalized next states
    pub next_state: Array2<f32>,
    /// Rewards
    pub reward: Array1<f32>,
    /// 0 for terminal transitions, 1 otherwise
    pub not_terminal: Array1<f32>,
}

impl TrainingBatch for MemoryNetworkInput {
    fn batch_size(&self) -> usize {
        self.state.nrows()
    }

    fn check_rows(&self) -> Result<()> {
        rows_match(
            self.batch_size(),
            &[
                self.action.nrows(),
                self.next_state.nrows(),
                self.reward.len(),
                self.not_terminal.len(),
            ],
        )
    }
}
