//! Model managers and training workflows for rlkit
//!
//! This crate provides:
//! - The `DataFetcher` contract with an in-memory implementation
//! - Feature identification into normalization data
//! - Reporters, the evaluator and the generic train-and-evaluate loop
//! - Discrete DQN, Soft Actor-Critic and CEM model managers
//! - Workflow configuration and an end-to-end training driver

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod data_fetcher;
pub mod evaluator;
pub mod identify_types;
pub mod model_managers;
pub mod reporters;
pub mod train_and_evaluate;
pub mod types;
pub mod workflow;

// Re-export data access and feature identification
pub use data_fetcher::{DataFetcher, FeatureColumn, InMemoryDataFetcher, QueryDataParams};
pub use identify_types::{identify_normalization_parameters, identify_parameter};

// Re-export managers
pub use model_managers::{
    AnyModelManager, CrossEntropyMethod, CrossEntropyMethodConfig, DiscreteDqn,
    DiscreteDqnConfig, ManagerPhase, ManagerState, ModelManager, ModelManagerUnion,
    SoftActorCritic, SoftActorCriticConfig,
};

// Re-export training and reporting
pub use evaluator::Evaluator;
pub use reporters::{
    ActorCriticReporter, ActorCriticTrainingReport, DiscreteDqnReporter,
    DiscreteDqnTrainingReport, Reporter, TrainingSummary, WorldModelReporter,
    WorldModelTrainingReport,
};
pub use train_and_evaluate::{train_and_evaluate_generic, ReporterHandles};

// Re-export configuration
pub use config::WorkflowConfig;
pub use types::{
    Dataset, EvaluationParameters, PreprocessingOptions, ReaderOptions, RewardOptions,
    RlTrainingOutput, RlTrainingReport, TableSpec,
};
pub use workflow::{train_workflow, TrainedWorkflow};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        train_workflow, AnyModelManager, DataFetcher, Dataset, InMemoryDataFetcher,
        ModelManager, ModelManagerUnion, TableSpec, WorkflowConfig,
    };
    pub use rlkit_core::prelude::*;
}
