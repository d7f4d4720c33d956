//! Policies and environment interaction for rlkit
//!
//! This crate provides:
//! - Action samplers and scorers composed into policies
//! - Random baseline policies for discrete and continuous action spaces
//! - Async environments with CartPole and continuous Mountain Car
//! - Episode rollouts, experience replay and online training

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod classic;
pub mod environment;
pub mod online;
pub mod policy;
pub mod replay_buffer;
pub mod runner;
pub mod samplers;
pub mod scorers;
pub mod trainer_preprocessor;

// Re-export policies
pub use policy::{
    make_policy_for_action_space, make_random_policy_for_env, ContinuousRandomPolicy,
    DiscreteRandomPolicy, DynPolicy, Policy, PolicyChoice,
};
pub use samplers::{
    ContinuousRandomSampler, DiscreteRandomSampler, GaussianSampler, GreedyActionSampler,
    Sampler, Scores, SoftmaxActionSampler,
};
pub use scorers::{
    ActorScorer, ActorServingScorer, CemPlannerScorer, CemPlannerServingScorer,
    DiscreteDqnScorer, DiscreteDqnServingScorer, NullScorer, Scorer,
};

// Re-export environments and rollouts
pub use classic::{CartPoleConfig, CartPoleEnv, MountainCarConfig, MountainCarContinuousEnv};
pub use environment::{Environment, Step};
pub use online::{train_online, OnlineTrainingOptions};
pub use replay_buffer::ReplayBuffer;
pub use runner::{evaluate_for_n_episodes, run_episode};
pub use trainer_preprocessor::{ActionColumns, ReplayTrainerPreprocessor, TransitionEncoder};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        make_policy_for_action_space, run_episode, CartPoleEnv, DynPolicy, Environment, Policy,
        PolicyChoice, Sampler, Scorer, Scores,
    };
    pub use rlkit_core::prelude::*;
}
