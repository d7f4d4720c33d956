//! Networks, preprocessing and trainers for rlkit
//!
//! This crate provides:
//! - ndarray fully-connected networks with Adam/SGD optimizers
//! - Q networks, Gaussian actors and probabilistic world models
//! - Net-builder configuration unions and serving modules
//! - Feature preprocessing and per-trainer batch preprocessors
//! - The `Trainer` contract with DQN, SAC, world-model and CEM trainers

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cem_planner;
pub mod cem_trainer;
pub mod device;
pub mod dqn_trainer;
pub mod models;
pub mod net_builder;
pub mod nn;
pub mod optimizer;
pub mod parameters;
pub mod preprocessing;
pub mod sac_trainer;
pub mod trainer;
pub mod types;
pub mod utils;
pub mod world_model;

// Re-export trainers
pub use cem_trainer::CemTrainer;
pub use dqn_trainer::DqnTrainer;
pub use sac_trainer::{SacNetworks, SacTrainer};
pub use trainer::{
    read_network, share, write_network, ObserverHandle, ObserverSet, SharedNetwork,
    SharedObserver, Trainer, TrainingObserver,
};
pub use world_model::{WorldModel, WorldModelLosses, WorldModelTrainer};

// Re-export networks
pub use cem_planner::{CemPlannerNetwork, PlannerActions};
pub use device::Device;
pub use models::{DiscreteQNetwork, GaussianActor, ParametricQNetwork, ValueNetwork};
pub use nn::{Activation, FullyConnectedNetwork};
pub use optimizer::{Optimizer, OptimizerKind, OptimizerParameters};

// Re-export configuration
pub use net_builder::{
    ActorServingModule, CemPlannerServingModule, ContinuousActorNetBuilderUnion,
    DiscreteDqnNetBuilderUnion, DiscreteDqnServingModule, ParametricDqnNetBuilderUnion,
    ValueNetBuilderUnion,
};
pub use parameters::{
    CemTrainerParameters, DqnTrainerParameters, RlParameters, SacTrainerParameters,
    WorldModelParameters,
};

// Re-export preprocessing
pub use preprocessing::{
    ActionEncoding, BatchPreprocessor, DiscreteDqnBatchPreprocessor,
    MemoryNetworkBatchPreprocessor, PolicyNetworkBatchPreprocessor, Postprocessor, Preprocessor,
    PreprocessorOptions,
};
pub use types::{DiscreteDqnInput, MemoryNetworkInput, PolicyNetworkInput, TrainingBatch};
pub use utils::{ExponentialSchedule, LinearSchedule, Schedule};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        BatchPreprocessor, CemTrainer, DqnTrainer, Preprocessor, SacTrainer, Trainer,
        TrainingObserver, WorldModelTrainer,
    };
    pub use rlkit_core::prelude::*;
}
