//! Asynchronous environment contract

use async_trait::async_trait;
use ndarray::Array1;

use rlkit_core::{ActionSpace, Result};

/// Result of one environment step
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Observation after the step
    pub observation: Array1<f32>,
    /// Reward for the step
    pub reward: f32,
    /// The episode reached a terminal state
    pub terminal: bool,
    /// The episode was cut off without reaching a terminal state
    pub truncated: bool,
}

impl Step {
    /// Whether the episode is over for either reason
    #[must_use]
    pub fn done(&self) -> bool {
        self.terminal || self.truncated
    }
}

/// Gym-style environment.
///
/// Actions use the policy encoding: one-hot rows for discrete spaces and raw
/// values for continuous boxes.
#[async_trait]
pub trait Environment: Send {
    /// Space actions are drawn from
    fn action_space(&self) -> ActionSpace;

    /// Width of an observation
    fn observation_dim(&self) -> usize;

    /// Start a new episode and return its first observation
    async fn reset(&mut self) -> Result<Array1<f32>>;

    /// Apply one action
    async fn step(&mut self, action: &Array1<f32>) -> Result<Step>;
}
