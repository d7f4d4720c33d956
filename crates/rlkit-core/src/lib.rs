//! Core reinforcement learning types for rlkit
//!
//! This crate provides the data model shared by the training, environment
//! and workflow crates: action spaces, observation batches, actor outputs,
//! normalization statistics and logged transitions.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod error;
pub mod normalization;
pub mod trajectory;
pub mod types;

// Re-export core types
pub use action::{ActionSpace, ContinuousActionRange};
pub use error::{RLError, Result};
pub use normalization::{
    FeatureType, NormalizationData, NormalizationDataMap, NormalizationKey,
    NormalizationParameters,
};
pub use trajectory::{Trajectory, Transition};
pub use types::{
    ActorOutput, DqnPolicyActionSet, FeatureData, FeatureId, PolicyActionSet, RawAction,
    RawFeatures, SacPolicyActionSet, TrainingMetrics, TransitionRow,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ActionSpace, ActorOutput, FeatureData, NormalizationData, NormalizationKey,
        PolicyActionSet, RLError, Result, TrainingMetrics, TransitionRow,
    };
}
