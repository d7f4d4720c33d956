//! Choice of model manager

use serde::{Deserialize, Serialize};

use rlkit_core::Result;
use rlkit_gym::DynPolicy;

use super::{
    CrossEntropyMethod, CrossEntropyMethodConfig, DiscreteDqn, DiscreteDqnConfig, ManagerPhase,
    ModelManager, SoftActorCritic, SoftActorCriticConfig,
};

/// Exactly one model manager configuration, e.g. `{"DiscreteDQN": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelManagerUnion {
    /// Discrete DQN
    #[serde(rename = "DiscreteDQN")]
    DiscreteDqn(DiscreteDqnConfig),
    /// Soft Actor-Critic
    SoftActorCritic(SoftActorCriticConfig),
    /// Cross-entropy-method planning
    CrossEntropyMethod(CrossEntropyMethodConfig),
}

impl ModelManagerUnion {
    /// Construct the selected manager
    pub fn value(&self, use_gpu: bool) -> Result<AnyModelManager> {
        Ok(match self {
            Self::DiscreteDqn(config) => {
                AnyModelManager::DiscreteDqn(DiscreteDqn::new(config.clone(), use_gpu)?)
            }
            Self::SoftActorCritic(config) => {
                AnyModelManager::SoftActorCritic(SoftActorCritic::new(config.clone(), use_gpu)?)
            }
            Self::CrossEntropyMethod(config) => AnyModelManager::CrossEntropyMethod(
                CrossEntropyMethod::new(config.clone(), use_gpu)?,
            ),
        })
    }
}

/// A constructed manager of any family
pub enum AnyModelManager {
    /// Discrete DQN
    DiscreteDqn(DiscreteDqn),
    /// Soft Actor-Critic
    SoftActorCritic(SoftActorCritic),
    /// Cross-entropy-method planning
    CrossEntropyMethod(CrossEntropyMethod),
}

impl AnyModelManager {
    /// Family name as used in configuration
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::DiscreteDqn(_) => "DiscreteDQN",
            Self::SoftActorCritic(_) => "SoftActorCritic",
            Self::CrossEntropyMethod(_) => "CrossEntropyMethod",
        }
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> ManagerPhase {
        match self {
            Self::DiscreteDqn(m) => m.phase(),
            Self::SoftActorCritic(m) => m.phase(),
            Self::CrossEntropyMethod(m) => m.phase(),
        }
    }

    /// See [`ModelManager::create_policy`]
    pub fn create_policy(&mut self, serving: bool) -> Result<DynPolicy> {
        match self {
            Self::DiscreteDqn(m) => m.create_policy(serving),
            Self::SoftActorCritic(m) => m.create_policy(serving),
            Self::CrossEntropyMethod(m) => m.create_policy(serving),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlkit_core::RLError;

    #[test]
    fn union_selects_exactly_one_manager() {
        let union: ModelManagerUnion = serde_json::from_str(
            r#"{"DiscreteDQN": {"trainer_param": {"actions": ["L", "R"]}}}"#,
        )
        .unwrap();
        let manager = union.value(false).unwrap();
        assert_eq!(manager.name(), "DiscreteDQN");
        assert_eq!(manager.phase(), ManagerPhase::Constructed);

        assert!(serde_json::from_str::<ModelManagerUnion>("{}").is_err());
        assert!(serde_json::from_str::<ModelManagerUnion>(
            r#"{"SoftActorCritic": {}, "CrossEntropyMethod": {}}"#
        )
        .is_err());
    }

    #[test]
    fn invalid_config_fails_at_resolution() {
        let union: ModelManagerUnion = serde_json::from_str(r#"{"DiscreteDQN": {}}"#).unwrap();
        assert!(matches!(union.value(false), Err(RLError::Configuration(_))));
    }
}
