//! Trajectory and transition storage

use ndarray::Array1;

/// Single environment transition as seen by a policy
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Observation the action was chosen from
    pub observation: Vec<f32>,
    /// Action taken, in policy encoding
    pub action: Array1<f32>,
    /// Reward received
    pub reward: f32,
    /// Observation after the step
    pub next_observation: Vec<f32>,
    /// Whether the episode ended (not truncated) at this step
    pub terminal: bool,
    /// Log-probability of the action under the acting policy
    pub log_prob: f32,
}

/// Complete trajectory of an episode
#[derive(Debug, Clone)]
pub struct Trajectory {
    /// Sequence of transitions
    pub transitions: Vec<Transition>,
    /// Total reward
    pub total_reward: f32,
    /// Episode ID
    pub episode_id: String,
}

impl Trajectory {
    /// Create a new empty trajectory
    pub fn new(episode_id: impl Into<String>) -> Self {
        Self {
            transitions: Vec::new(),
            total_reward: 0.0,
            episode_id: episode_id.into(),
        }
    }

    /// Add a transition to the trajectory
    pub fn push(&mut self, transition: Transition) {
        self.total_reward += transition.reward;
        self.transitions.push(transition);
    }

    /// Get the length of the trajectory
    #[must_use]
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// Check if trajectory is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Compute returns (cumulative discounted rewards)
    #[must_use]
    pub fn returns(&self, gamma: f32) -> Vec<f32> {
        let mut returns = vec![0.0; self.len()];
        let mut running_return = 0.0;

        for i in (0..self.len()).rev() {
            if self.transitions[i].terminal {
                running_return = 0.0;
            }
            running_return = self.transitions[i].reward + gamma * running_return;
            returns[i] = running_return;
        }

        returns
    }
}
