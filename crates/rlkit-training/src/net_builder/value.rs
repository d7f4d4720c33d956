//! Builders for state-value networks

use serde::{Deserialize, Serialize};

use rlkit_core::{NormalizationData, Result};

use super::{check_layers, non_empty_dim, ValueNetBuilder};
use crate::models::ValueNetwork;
use crate::nn::{Activation, FullyConnectedNetwork};

/// V(s) with a single linear output
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
            sizes: vec![32, 32],
            activations: vec![Activation::Relu, Activation::Relu],
        }
    }
}

impl ValueNetBuilder for FullyConnected {
    fn validate(&self) -> Result<()> {
        check_layers(&self.sizes, &self.activations)
    }

    fn build_value_network(
        &self,
        state_normalization_data: &NormalizationData,
    ) -> Result<ValueNetwork> {
        let state_dim = non_empty_dim(state_normalization_data, "state")?;
        FullyConnectedNetwork::new(state_dim, &self.sizes, &self.activations, 1)
    }
}
