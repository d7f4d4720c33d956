//! Builders for discrete-action Q networks

use serde::{Deserialize, Serialize};

use rlkit_core::{NormalizationData, Result};

use super::{check_layers, non_empty_dim, DiscreteDqnNetBuilder};
use crate::models::DiscreteQNetwork;
use crate::nn::{Activation, FullyConnectedNetwork};

/// Plain multilayer Q network with one output per action
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
            sizes: vec![256, 128],
            activations: vec![Activation::Relu, Activation::Relu],
        }
    }
}

impl DiscreteDqnNetBuilder for FullyConnected {
    fn validate(&self) -> Result<()> {
        check_layers(&self.sizes, &self.activations)
    }

    fn build_q_network(
        &self,
        state_normalization_data: &NormalizationData,
        num_actions: usize,
    ) -> Result<DiscreteQNetwork> {
        let state_dim = non_empty_dim(state_normalization_data, "state")?;
        let body =
            FullyConnectedNetwork::new(state_dim, &self.sizes, &self.activations, num_actions)?;
        DiscreteQNetwork::fully_connected(body, num_actions)
    }
}

/// Dueling architecture: a shared body with value and advantage heads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dueling {
    /// Hidden layer widths
    pub sizes: Vec<usize>,
    /// One activation per hidden layer
    pub activations: Vec<Activation>,
}

impl Default for Dueling {
    fn default() -> Self {
        Self {
            sizes: vec![256, 128],
            activations: vec![Activation::Relu, Activation::Relu],
        }
    }
}

impl DiscreteDqnNetBuilder for Dueling {
    fn validate(&self) -> Result<()> {
        check_layers(&self.sizes, &self.activations)
    }

    fn build_q_network(
        &self,
        state_normalization_data: &NormalizationData,
        num_actions: usize,
    ) -> Result<DiscreteQNetwork> {
        let state_dim = non_empty_dim(state_normalization_data, "state")?;
        let body = FullyConnectedNetwork::new(
            state_dim,
            &self.sizes,
            &self.activations,
            num_actions + 1,
        )?;
        DiscreteQNetwork::dueling(body, num_actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rlkit_core::{NormalizationParameters, RLError};
    use std::collections::BTreeMap;

    fn state_data() -> NormalizationData {
        let mut params = BTreeMap::new();
        params.insert(1, NormalizationParameters::continuous(0.0, 1.0, -3.0, 3.0));
        params.insert(2, NormalizationParameters::continuous(0.0, 1.0, -3.0, 3.0));
        NormalizationData::new(params)
    }

    #[test]
    fn builders_produce_one_q_value_per_action() {
        let state = Array2::zeros((5, 2));
        let plain = FullyConnected {
            sizes: vec![8],
            activations: vec![Activation::Tanh],
        };
        let q = plain.build_q_network(&state_data(), 4).unwrap();
        assert_eq!(q.forward(&state).unwrap().dim(), (5, 4));
        assert!(!q.is_dueling());

        let dueling = Dueling {
            sizes: vec![8],
            activations: vec![Activation::Relu],
        };
        let q = dueling.build_q_network(&state_data(), 3).unwrap();
        assert_eq!(q.forward(&state).unwrap().dim(), (5, 3));
        assert!(q.is_dueling());
    }

    #[test]
    fn mismatched_layer_config_is_rejected() {
        let builder = FullyConnected {
            sizes: vec![8, 8],
            activations: vec![Activation::Relu],
        };
        assert!(matches!(builder.validate(), Err(RLError::Configuration(_))));
    }
}
