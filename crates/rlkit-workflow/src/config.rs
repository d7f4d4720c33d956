//! Top-level workflow configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use rlkit_core::Result;

use crate::model_managers::ModelManagerUnion;
use crate::types::{RewardOptions, TableSpec};

/// Everything [`crate::train_workflow`] needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Which manager to train, with its configuration
    pub model: ModelManagerUnion,
    /// Table holding the training data
    pub input_table_spec: TableSpec,
    /// Training epochs
    #[serde(default = "default_num_train_epochs")]
    pub num_train_epochs: usize,
    /// Place networks on an accelerator
    #[serde(default)]
    pub use_gpu: bool,
    /// Reward shaping during the query
    #[serde(default)]
    pub reward_options: RewardOptions,
    /// Episode percentile range used for training
    #[serde(default)]
    pub train_sample_range: Option<(f32, f32)>,
    /// Episode percentile range used for evaluation
    #[serde(default)]
    pub eval_sample_range: Option<(f32, f32)>,
}

fn default_num_train_epochs() -> usize {
    1
}

impl WorkflowConfig {
    /// Parse from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
