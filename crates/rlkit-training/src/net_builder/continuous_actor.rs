//! Builders for continuous-action policies

use serde::{Deserialize, Serialize};

use rlkit_core::{NormalizationData, RLError, Result};

use super::{check_layers, non_empty_dim, ContinuousActorNetBuilder};
use crate::models::GaussianActor;
use crate::nn::{Activation, FullyConnectedNetwork};

/// Gaussian policy on a fully-connected body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaussianFullyConnected {
    /// Hidden layer widths
    pub sizes: Vec<usize>,
    /// One activation per hidden layer
    pub activations: Vec<Activation>,
    /// Lower clamp of the predicted log standard deviation
    pub log_scale_min: f32,
    /// Upper clamp of the predicted log standard deviation
    pub log_scale_max: f32,
}

impl Default for GaussianFullyConnected {
    fn default() -> Self {
        Self {
            sizes: vec![128, 64],
            activations: vec![Activation::Relu, Activation::Relu],
            log_scale_min: -20.0,
            log_scale_max: 2.0,
        }
    }
}

impl ContinuousActorNetBuilder for GaussianFullyConnected {
    fn validate(&self) -> Result<()> {
        check_layers(&self.sizes, &self.activations)?;
        if self.log_scale_min >= self.log_scale_max {
            return Err(RLError::Configuration(format!(
                "log_scale_min {} must be below log_scale_max {}",
                self.log_scale_min, self.log_scale_max
            )));
        }
        Ok(())
    }

    fn build_actor(
        &self,
        state_normalization_data: &NormalizationData,
        action_normalization_data: &NormalizationData,
    ) -> Result<GaussianActor> {
        let state_dim = non_empty_dim(state_normalization_data, "state")?;
        let action_dim = non_empty_dim(action_normalization_data, "action")?;
        let body = FullyConnectedNetwork::new(
            state_dim,
            &self.sizes,
            &self.activations,
            2 * action_dim,
        )?;
        GaussianActor::new(body, action_dim, self.log_scale_min, self.log_scale_max)
    }
}
