//! Network builders and their configuration unions
//!
//! Each union is an externally tagged enum, so a configuration names exactly
//! one builder kind, e.g. `{"Dueling": {"sizes": [64, 64], ...}}`. An empty
//! object or more than one key fails to parse. Model managers resolve a
//! union once, at construction, into an `Arc<dyn ...NetBuilder>` via
//! `value()`, which also validates the builder's layer configuration.

pub mod continuous_actor;
pub mod discrete_dqn;
pub mod parametric_dqn;
pub mod serving;
pub mod value;

use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use rlkit_core::{NormalizationData, RLError, Result};

use crate::models::{DiscreteQNetwork, GaussianActor, ParametricQNetwork, ValueNetwork};
use crate::nn::Activation;
use crate::preprocessing::{Postprocessor, Preprocessor, PreprocessorOptions};

pub use serving::{ActorServingModule, CemPlannerServingModule, DiscreteDqnServingModule};

/// Builds Q networks with one output per discrete action
pub trait DiscreteDqnNetBuilder: Debug + Send + Sync {
    /// Check the configuration without building anything
    fn validate(&self) -> Result<()>;

    /// Fresh Q network for normalized states
    fn build_q_network(
        &self,
        state_normalization_data: &NormalizationData,
        num_actions: usize,
    ) -> Result<DiscreteQNetwork>;

    /// Snapshot `q_network` behind the state preprocessing
    fn build_serving_module(
        &self,
        q_network: &DiscreteQNetwork,
        state_normalization_data: &NormalizationData,
        action_names: &[String],
        options: PreprocessorOptions,
    ) -> Result<DiscreteDqnServingModule> {
        DiscreteDqnServingModule::new(
            action_names.to_vec(),
            Preprocessor::new(state_normalization_data, options)?,
            q_network.clone(),
        )
    }
}

/// Builds Gaussian policies over continuous actions
pub trait ContinuousActorNetBuilder: Debug + Send + Sync {
    /// Check the configuration without building anything
    fn validate(&self) -> Result<()>;

    /// Fresh actor for normalized states
    fn build_actor(
        &self,
        state_normalization_data: &NormalizationData,
        action_normalization_data: &NormalizationData,
    ) -> Result<GaussianActor>;

    /// Snapshot `actor` behind state preprocessing and action postprocessing
    fn build_serving_module(
        &self,
        actor: &GaussianActor,
        state_normalization_data: &NormalizationData,
        action_normalization_data: &NormalizationData,
        options: PreprocessorOptions,
    ) -> Result<ActorServingModule> {
        ActorServingModule::new(
            Preprocessor::new(state_normalization_data, options)?,
            actor.clone(),
            Postprocessor::new(action_normalization_data, options.continuous_action_range)?,
        )
    }
}

/// Builds state-action critics
pub trait ParametricDqnNetBuilder: Debug + Send + Sync {
    /// Check the configuration without building anything
    fn validate(&self) -> Result<()>;

    /// Fresh critic for normalized states and actions
    fn build_q_network(
        &self,
        state_normalization_data: &NormalizationData,
        action_normalization_data: &NormalizationData,
    ) -> Result<ParametricQNetwork>;
}

/// Builds state-value networks
pub trait ValueNetBuilder: Debug + Send + Sync {
    /// Check the configuration without building anything
    fn validate(&self) -> Result<()>;

    /// Fresh value network for normalized states
    fn build_value_network(
        &self,
        state_normalization_data: &NormalizationData,
    ) -> Result<ValueNetwork>;
}

/// Choice of discrete Q network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscreteDqnNetBuilderUnion {
    /// Plain multilayer network
    FullyConnected(discrete_dqn::FullyConnected),
    /// Value and advantage heads
    Dueling(discrete_dqn::Dueling),
}

impl Default for DiscreteDqnNetBuilderUnion {
    fn default() -> Self {
        Self::FullyConnected(discrete_dqn::FullyConnected::default())
    }
}

impl DiscreteDqnNetBuilderUnion {
    /// Validate and resolve the selected builder
    pub fn value(&self) -> Result<Arc<dyn DiscreteDqnNetBuilder>> {
        let builder: Arc<dyn DiscreteDqnNetBuilder> = match self {
            Self::FullyConnected(b) => Arc::new(b.clone()),
            Self::Dueling(b) => Arc::new(b.clone()),
        };
        builder.validate()?;
        Ok(builder)
    }
}

/// Choice of continuous actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContinuousActorNetBuilderUnion {
    /// Gaussian head on a multilayer body
    GaussianFullyConnected(continuous_actor::GaussianFullyConnected),
}

impl Default for ContinuousActorNetBuilderUnion {
    fn default() -> Self {
        Self::GaussianFullyConnected(continuous_actor::GaussianFullyConnected::default())
    }
}

impl ContinuousActorNetBuilderUnion {
    /// Validate and resolve the selected builder
    pub fn value(&self) -> Result<Arc<dyn ContinuousActorNetBuilder>> {
        let builder: Arc<dyn ContinuousActorNetBuilder> = match self {
            Self::GaussianFullyConnected(b) => Arc::new(b.clone()),
        };
        builder.validate()?;
        Ok(builder)
    }
}

/// Choice of state-action critic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParametricDqnNetBuilderUnion {
    /// Multilayer network on concatenated inputs
    FullyConnected(parametric_dqn::FullyConnected),
}

impl Default for ParametricDqnNetBuilderUnion {
    fn default() -> Self {
        Self::FullyConnected(parametric_dqn::FullyConnected::default())
    }
}

impl ParametricDqnNetBuilderUnion {
    /// Validate and resolve the selected builder
    pub fn value(&self) -> Result<Arc<dyn ParametricDqnNetBuilder>> {
        let builder: Arc<dyn ParametricDqnNetBuilder> = match self {
            Self::FullyConnected(b) => Arc::new(b.clone()),
        };
        builder.validate()?;
        Ok(builder)
    }
}

/// Choice of state-value network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueNetBuilderUnion {
    /// Multilayer network with a scalar output
    FullyConnected(value::FullyConnected),
}

impl Default for ValueNetBuilderUnion {
    fn default() -> Self {
        Self::FullyConnected(value::FullyConnected::default())
    }
}

impl ValueNetBuilderUnion {
    /// Validate and resolve the selected builder
    pub fn value(&self) -> Result<Arc<dyn ValueNetBuilder>> {
        let builder: Arc<dyn ValueNetBuilder> = match self {
            Self::FullyConnected(b) => Arc::new(b.clone()),
        };
        builder.validate()?;
        Ok(builder)
    }
}

pub(crate) fn check_layers(sizes: &[usize], activations: &[Activation]) -> Result<()> {
    if sizes.len() != activations.len() {
        return Err(RLError::Configuration(format!(
            "{} layer sizes but {} activations",
            sizes.len(),
            activations.len()
        )));
    }
    if sizes.contains(&0) {
        return Err(RLError::Configuration(format!(
            "layer sizes must be positive, got {sizes:?}"
        )));
    }
    Ok(())
}

pub(crate) fn non_empty_dim(data: &NormalizationData, what: &str) -> Result<usize> {
    match data.output_dim() {
        0 => Err(RLError::Configuration(format!(
            "{what} normalization data has no features"
        ))),
        dim => Ok(dim),
    }
}
