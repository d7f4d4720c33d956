//! Builders for state-action critics

use serde::{Deserialize, Serialize};

use rlkit_core::{NormalizationData, Result};

use super::{check_layers, non_empty_dim, ParametricDqnNetBuilder};
use crate::models::ParametricQNetwork;
use crate::nn::{Activation, FullyConnectedNetwork};

/// Q(s, a) on the concatenated state and action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FullyConnected {
    /// Hidden layer widths
    pub sizes: Vec<usize>,
    /// One activation per hidden layer
    pub activations: Vec<Activation>,
}

impl Default for FullyConnected {
    fn default() -> Self {
        Self {
            sizes: vec![128, 64],
            activations: vec![Activation::Relu, Activation::Relu],
        }
    }
}

impl ParametricDqnNetBuilder for FullyConnected {
    fn validate(&self) -> Result<()> {
        check_layers(&self.sizes, &self.activations)
    }

    fn build_q_network(
        &self,
        state_normalization_data: &NormalizationData,
        action_normalization_data: &NormalizationData,
    ) -> Result<ParametricQNetwork> {
        let state_dim = non_empty_dim(state_normalization_data, "state")?;
        let action_dim = non_empty_dim(action_normalization_data, "action")?;
        let body = FullyConnectedNetwork::new(
            state_dim + action_dim,
            &self.sizes,
            &self.activations,
            1,
        )?;
        ParametricQNetwork::new(body, state_dim, action_dim)
    }
}
