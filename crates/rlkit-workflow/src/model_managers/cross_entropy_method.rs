//! Cross-entropy-method model manager over a world-model ensemble

use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use rlkit_core::{NormalizationDataMap, NormalizationKey, RLError, Result};
use rlkit_gym::{CemPlannerScorer, CemPlannerServingScorer, DynPolicy, GreedyActionSampler, Policy};
use rlkit_training::{
    share, ActionEncoding, CemPlannerNetwork, CemPlannerServingModule, CemTrainer,
    CemTrainerParameters, Device, MemoryNetworkBatchPreprocessor, PlannerActions, Postprocessor,
    Preprocessor, PreprocessorOptions, SharedNetwork, WorldModel, WorldModelTrainer,
};

use super::{
    identify_continuous_action_features, identify_state_features, ManagerPhase, ManagerState,
    ModelManager,
};
use crate::data_fetcher::{DataFetcher, QueryDataParams};
use crate::reporters::WorldModelReporter;
use crate::types::{
    Dataset, EvaluationParameters, PreprocessingOptions, ReaderOptions, RewardOptions, TableSpec,
};

/// Configuration of [`CrossEntropyMethod`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossEntropyMethodConfig {
    /// Planner and world-model parameters
    pub trainer_param: CemTrainerParameters,
    /// Named discrete actions; empty plans over continuous action features
    pub discrete_actions: Vec<String>,
    /// State feature identification
    pub state_preprocessing_options: PreprocessingOptions,
    /// Action feature identification for continuous planners
    pub action_preprocessing_options: PreprocessingOptions,
    /// Minibatch shuffling; the size follows `trainer_param.mdnrnn.minibatch_size`
    pub reader_options: ReaderOptions,
    /// Evaluation during training
    pub eval_parameters: EvaluationParameters,
    /// Feature scaling and the action training range
    pub preprocessor_options: PreprocessorOptions,
}

/// Trains a world-model ensemble and plans with it
pub struct CrossEntropyMethod {
    config: CrossEntropyMethodConfig,
    device: Device,
    state: ManagerState,
    planner: Option<Arc<CemPlannerNetwork>>,
    trainer: Option<CemTrainer>,
}

impl CrossEntropyMethod {
    /// Validate the ensemble configuration
    pub fn new(config: CrossEntropyMethodConfig, use_gpu: bool) -> Result<Self> {
        if config.trainer_param.num_world_models == 0 {
            return Err(RLError::Configuration(
                "CEM needs at least one world model".to_string(),
            ));
        }
        Ok(Self {
            config,
            device: Device::from_use_gpu(use_gpu),
            state: ManagerState::new(),
            planner: None,
            trainer: None,
        })
    }

    /// Whether the planner picks among named discrete actions
    #[must_use]
    pub fn is_discrete(&self) -> bool {
        !self.config.discrete_actions.is_empty()
    }

    /// Planner of the latest built trainer
    pub fn planner(&self) -> Result<Arc<CemPlannerNetwork>> {
        self.planner.clone().ok_or_else(|| {
            RLError::invalid_phase("planner", ManagerPhase::TrainerBuilt, self.state.phase())
        })
    }

    fn preprocessor(&self, key: NormalizationKey, operation: &str) -> Result<Preprocessor> {
        Preprocessor::new(
            self.state.normalization_data(key, operation)?,
            self.config.preprocessor_options,
        )
    }

    fn planner_actions(&self, operation: &str) -> Result<PlannerActions> {
        if self.is_discrete() {
            return Ok(PlannerActions::Discrete {
                num_actions: self.config.discrete_actions.len(),
            });
        }
        let action_dim = self
            .state
            .normalization_data(NormalizationKey::Action, operation)?
            .output_dim();
        if action_dim == 0 {
            return Err(RLError::Configuration(
                "continuous planner has no action features".to_string(),
            ));
        }
        Ok(PlannerActions::Continuous {
            action_dim,
            range: self.config.preprocessor_options.continuous_action_range,
        })
    }
}

impl ModelManager for CrossEntropyMethod {
    type Trainer = CemTrainer;
    type BatchPreprocessor = MemoryNetworkBatchPreprocessor;
    type ServingModule = CemPlannerServingModule;
    type Reporter = WorldModelReporter;

    fn state(&self) -> &ManagerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ManagerState {
        &mut self.state
    }

    fn trainer_slot(&mut self) -> &mut Option<CemTrainer> {
        &mut self.trainer
    }

    fn run_feature_identification(
        &self,
        fetcher: &dyn DataFetcher,
        table: &TableSpec,
    ) -> Result<NormalizationDataMap> {
        let mut map = NormalizationDataMap::new();
        map.insert(
            NormalizationKey::State,
            identify_state_features(fetcher, table, &self.config.state_preprocessing_options)?,
        );
        if !self.is_discrete() {
            map.insert(
                NormalizationKey::Action,
                identify_continuous_action_features(
                    fetcher,
                    table,
                    &self.config.action_preprocessing_options,
                )?,
            );
        }
        Ok(map)
    }

    fn query_data(
        &self,
        fetcher: &dyn DataFetcher,
        table: &TableSpec,
        sample_range: Option<(f32, f32)>,
        reward_options: &RewardOptions,
    ) -> Result<Dataset> {
        let rl = &self.config.trainer_param.rl;
        fetcher.query_data(&QueryDataParams {
            table: table.clone(),
            discrete_action: self.is_discrete(),
            actions: self.config.discrete_actions.clone(),
            include_possible_actions: false,
            sample_range,
            custom_reward_expression: reward_options.custom_reward_expression.clone(),
            multi_steps: rl.multi_steps,
            gamma: rl.gamma,
        })
    }

    fn should_generate_eval_dataset(&self) -> bool {
        self.config.eval_parameters.calc_cpe_in_training
    }

    fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            minibatch_size: self.config.trainer_param.mdnrnn.minibatch_size,
            ..self.config.reader_options.clone()
        }
    }

    fn build_batch_preprocessor(&self) -> Result<MemoryNetworkBatchPreprocessor> {
        let operation = "build_batch_preprocessor";
        let action = if self.is_discrete() {
            ActionEncoding::Discrete(self.config.discrete_actions.clone())
        } else {
            ActionEncoding::Continuous(self.preprocessor(NormalizationKey::Action, operation)?)
        };
        MemoryNetworkBatchPreprocessor::new(
            self.preprocessor(NormalizationKey::State, operation)?,
            action,
        )
    }

    fn create_reporter(&self) -> WorldModelReporter {
        WorldModelReporter::new()
    }

    fn build_trainer(&mut self) -> Result<CemTrainer> {
        let operation = "build_trainer";
        self.state.require(operation, ManagerPhase::FeaturesIdentified)?;
        self.device.ensure_available()?;

        let state_dim = self
            .state
            .normalization_data(NormalizationKey::State, operation)?
            .output_dim();
        if state_dim == 0 {
            return Err(RLError::Configuration(
                "state normalization data has no features".to_string(),
            ));
        }
        let actions = self.planner_actions(operation)?;
        let params = &self.config.trainer_param;

        let world_models = (0..params.num_world_models)
            .map(|_| -> Result<SharedNetwork<WorldModel>> {
                let mut model = WorldModel::new(state_dim, actions.action_dim(), &params.mdnrnn)?;
                model.place(self.device)?;
                Ok(share(model))
            })
            .collect::<Result<Vec<_>>>()?;
        let world_model_trainers = world_models
            .iter()
            .map(|model| WorldModelTrainer::new(model.clone(), params.mdnrnn.clone()))
            .collect();
        let planner = Arc::new(CemPlannerNetwork::new(world_models, params, actions)?);
        let trainer = CemTrainer::new(planner.clone(), world_model_trainers)?;

        self.planner = Some(planner);
        self.state.advance(ManagerPhase::TrainerBuilt);
        counter!("rlkit_trainers_built_total", 1);
        info!(
            world_models = self.config.trainer_param.num_world_models,
            discrete = self.is_discrete(),
            device = %self.device,
            "built CEM trainer"
        );
        Ok(trainer)
    }

    fn build_serving_module(&mut self) -> Result<CemPlannerServingModule> {
        let operation = "build_serving_module";
        self.state.require(operation, ManagerPhase::TrainerBuilt)?;
        let planner = self.planner()?;
        let postprocessor = if self.is_discrete() {
            None
        } else {
            Some(Postprocessor::new(
                self.state.normalization_data(NormalizationKey::Action, operation)?,
                self.config.preprocessor_options.continuous_action_range,
            )?)
        };
        let module = CemPlannerServingModule::new(
            self.preprocessor(NormalizationKey::State, operation)?,
            &planner,
            postprocessor,
        )?;
        self.state.advance(ManagerPhase::ServingModuleBuilt);
        Ok(module)
    }

    fn create_policy(&mut self, serving: bool) -> Result<DynPolicy> {
        if serving {
            let module = Arc::new(self.build_serving_module()?);
            return Ok(Policy::new(CemPlannerServingScorer::new(module), GreedyActionSampler).boxed());
        }
        self.state.require("create_policy", ManagerPhase::TrainerBuilt)?;
        let scorer = CemPlannerScorer::new(
            self.planner()?,
            self.preprocessor(NormalizationKey::State, "create_policy")?,
        );
        Ok(Policy::new(scorer, GreedyActionSampler).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlkit_core::{FeatureData, NormalizationData, NormalizationParameters};
    use rlkit_training::{Trainer, WorldModelParameters};
    use std::collections::BTreeMap;

    fn small_params(num_world_models: usize) -> CemTrainerParameters {
        CemTrainerParameters {
            num_world_models,
            plan_horizon_length: 2,
            cem_population_size: 8,
            cem_num_iterations: 2,
            num_elites: 2,
            mdnrnn: WorldModelParameters {
                hidden_sizes: vec![8],
                ..WorldModelParameters::default()
            },
            ..CemTrainerParameters::default()
        }
    }

    fn state_only() -> NormalizationDataMap {
        let state = (1..=2)
            .map(|id| (id, NormalizationParameters::continuous(0.0, 1.0, -3.0, 3.0)))
            .collect::<BTreeMap<_, _>>();
        NormalizationDataMap::from([(NormalizationKey::State, NormalizationData::new(state))])
    }

    #[test]
    fn zero_world_models_is_a_configuration_error() {
        let config = CrossEntropyMethodConfig {
            trainer_param: small_params(0),
            discrete_actions: vec!["L".to_string()],
            ..CrossEntropyMethodConfig::default()
        };
        assert!(matches!(
            CrossEntropyMethod::new(config, false),
            Err(RLError::Configuration(_))
        ));
    }

    #[test]
    fn ensemble_shares_models_with_the_planner() {
        let config = CrossEntropyMethodConfig {
            trainer_param: small_params(3),
            discrete_actions: vec!["L".to_string(), "R".to_string()],
            ..CrossEntropyMethodConfig::default()
        };
        let mut manager = CrossEntropyMethod::new(config, false).unwrap();
        manager.set_normalization_data_map(state_only()).unwrap();
        let trainer = manager.build_trainer().unwrap();
        assert_eq!(trainer.world_model_trainers().len(), 3);
        assert_eq!(manager.planner().unwrap().num_world_models(), 3);
        assert_eq!(trainer.minibatch(), 0);
    }

    #[test]
    fn discrete_planner_policy_returns_one_hot_actions() {
        let config = CrossEntropyMethodConfig {
            trainer_param: small_params(1),
            discrete_actions: vec!["A".to_string(), "B".to_string(), "C".to_string()],
            ..CrossEntropyMethodConfig::default()
        };
        let mut manager = CrossEntropyMethod::new(config, false).unwrap();
        manager.set_normalization_data_map(state_only()).unwrap();
        manager.initialize_trainer().unwrap();

        for serving in [false, true] {
            let policy = manager.create_policy(serving).unwrap();
            let obs = FeatureData::from_rows(&[vec![0.5, -0.5], vec![0.0, 1.0]]).unwrap();
            let out = policy.act(&obs).unwrap();
            assert_eq!(out.action.dim(), (2, 3));
            for row in out.action.rows() {
                assert_eq!(row.iter().filter(|&&v| v == 1.0).count(), 1);
            }
        }
    }

    #[test]
    fn continuous_planner_needs_action_features() {
        let config = CrossEntropyMethodConfig {
            trainer_param: small_params(1),
            ..CrossEntropyMethodConfig::default()
        };
        let mut manager = CrossEntropyMethod::new(config, false).unwrap();
        manager.set_normalization_data_map(state_only()).unwrap();
        assert!(matches!(manager.build_trainer(), Err(RLError::Precondition(_))));
    }
}
