//! Workflow configuration records and training outputs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use rlkit_core::{FeatureId, FeatureType, TransitionRow};

use crate::reporters::{ActorCriticTrainingReport, DiscreteDqnTrainingReport, WorldModelTrainingReport};

/// Names a training table held by a [`crate::DataFetcher`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableSpec {
    /// Table name
    pub table_name: String,
}

impl TableSpec {
    /// Spec for the table `table_name`
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
        }
    }
}

/// How datasets are cut into minibatches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderOptions {
    /// Rows per minibatch
    pub minibatch_size: usize,
    /// Shuffle rows at the start of every epoch
    pub shuffle: bool,
    /// Seed for shuffling
    pub seed: Option<u64>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            minibatch_size: 1024,
            shuffle: false,
            seed: None,
        }
    }
}

/// Feature identification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingOptions {
    /// Rows sampled per feature
    pub num_samples: usize,
    /// Integer-valued features with at most this many distinct values are enums
    pub max_unique_enum_values: usize,
    /// Only identify these features; `None` keeps every feature
    pub whitelist_features: Option<Vec<FeatureId>>,
    /// Forced feature types
    pub feature_overrides: BTreeMap<FeatureId, FeatureType>,
    /// Standard deviations below this are replaced by 1
    pub min_stddev: f32,
}

impl Default for PreprocessingOptions {
    fn default() -> Self {
        Self {
            num_samples: 100_000,
            max_unique_enum_values: 10,
            whitelist_features: None,
            feature_overrides: BTreeMap::new(),
            min_stddev: 1e-6,
        }
    }
}

/// Reward shaping applied while querying data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardOptions {
    /// Name of a logged metric used as the reward instead of the logged reward
    pub custom_reward_expression: Option<String>,
    /// Weights of logged metrics, reported alongside training
    pub metric_reward_values: Option<BTreeMap<String, f32>>,
}

/// Evaluation settings of a model manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationParameters {
    /// Query an evaluation dataset and evaluate after every epoch
    pub calc_cpe_in_training: bool,
}

impl Default for EvaluationParameters {
    fn default() -> Self {
        Self {
            calc_cpe_in_training: true,
        }
    }
}

/// Rows returned by a data query, in `(mdp_id, sequence_number)` order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Rows
    pub rows: Vec<TransitionRow>,
}

impl Dataset {
    /// Wrap rows
    #[must_use]
    pub fn new(rows: Vec<TransitionRow>) -> Self {
        Self { rows }
    }

    /// Number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Report produced by the reporter of one algorithm family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RlTrainingReport {
    /// Discrete DQN
    DiscreteDqn(DiscreteDqnTrainingReport),
    /// Actor-critic methods
    ActorCritic(ActorCriticTrainingReport),
    /// World-model ensembles
    WorldModel(WorldModelTrainingReport),
}

/// Result of [`crate::ModelManager::train`].
///
/// `output_path` is left unset; whoever persists the model fills it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlTrainingOutput {
    /// Where the trained model was written
    pub output_path: Option<PathBuf>,
    /// Report of the training run
    pub training_report: Option<RlTrainingReport>,
}

impl RlTrainingOutput {
    /// Output carrying only a report
    #[must_use]
    pub fn from_report(report: RlTrainingReport) -> Self {
        Self {
            output_path: None,
            training_report: Some(report),
        }
    }
}
