//! Discrete DQN model manager

use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use rlkit_core::{NormalizationDataMap, NormalizationKey, RLError, Result};
use rlkit_gym::{
    DiscreteDqnScorer, DiscreteDqnServingScorer, DynPolicy, GreedyActionSampler, Policy,
    SoftmaxActionSampler,
};
use rlkit_training::net_builder::DiscreteDqnNetBuilder;
use rlkit_training::{
    read_network, share, Device, DiscreteDqnBatchPreprocessor, DiscreteDqnNetBuilderUnion,
    DiscreteDqnServingModule, DiscreteQNetwork, DqnTrainer, DqnTrainerParameters, Preprocessor,
    PreprocessorOptions, SharedNetwork,
};

use super::{identify_state_features, ManagerPhase, ManagerState, ModelManager};
use crate::data_fetcher::{DataFetcher, QueryDataParams};
use crate::reporters::DiscreteDqnReporter;
use crate::types::{
    Dataset, EvaluationParameters, PreprocessingOptions, ReaderOptions, RewardOptions, TableSpec,
};

/// Configuration of [`DiscreteDqn`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscreteDqnConfig {
    /// Trainer parameters, including the action names
    pub trainer_param: DqnTrainerParameters,
    /// Q-network architecture
    pub net_builder: DiscreteDqnNetBuilderUnion,
    /// Desired share of each action, compared against the model's choices
    pub target_action_distribution: Option<Vec<f32>>,
    /// Feature identification
    pub preprocessing_options: PreprocessingOptions,
    /// Minibatch shuffling; the size follows `trainer_param.minibatch_size`
    pub reader_options: ReaderOptions,
    /// Evaluation during training
    pub eval_parameters: EvaluationParameters,
    /// Feature scaling
    pub preprocessor_options: PreprocessorOptions,
}

/// Trains a Q-network over named discrete actions
pub struct DiscreteDqn {
    config: DiscreteDqnConfig,
    net_builder: Arc<dyn DiscreteDqnNetBuilder>,
    device: Device,
    state: ManagerState,
    q_network: Option<SharedNetwork<DiscreteQNetwork>>,
    trainer: Option<DqnTrainer>,
}

impl DiscreteDqn {
    /// Validate the configuration and resolve the network builder
    pub fn new(config: DiscreteDqnConfig, use_gpu: bool) -> Result<Self> {
        let actions = &config.trainer_param.actions;
        if actions.is_empty() {
            return Err(RLError::Configuration(
                "discrete DQN needs at least one action".to_string(),
            ));
        }
        if let Some(target) = &config.target_action_distribution {
            if target.len() != actions.len() {
                return Err(RLError::Configuration(format!(
                    "target action distribution has {} entries for {} actions",
                    target.len(),
                    actions.len()
                )));
            }
        }
        let net_builder = config.net_builder.value()?;
        Ok(Self {
            net_builder,
            device: Device::from_use_gpu(use_gpu),
            state: ManagerState::new(),
            q_network: None,
            trainer: None,
            config,
        })
    }

    /// Action names in Q-value column order
    #[must_use]
    pub fn actions(&self) -> &[String] {
        &self.config.trainer_param.actions
    }

    /// Live Q-network of the latest built trainer
    pub fn q_network(&self) -> Result<SharedNetwork<DiscreteQNetwork>> {
        self.q_network.clone().ok_or_else(|| {
            RLError::invalid_phase("q_network", ManagerPhase::TrainerBuilt, self.state.phase())
        })
    }

    fn state_preprocessor(&self, operation: &str) -> Result<Preprocessor> {
        Preprocessor::new(
            self.state.normalization_data(NormalizationKey::State, operation)?,
            self.config.preprocessor_options,
        )
    }
}

impl ModelManager for DiscreteDqn {
    type Trainer = DqnTrainer;
    type BatchPreprocessor = DiscreteDqnBatchPreprocessor;
    type ServingModule = DiscreteDqnServingModule;
    type Reporter = DiscreteDqnReporter;

    fn state(&self) -> &ManagerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ManagerState {
        &mut self.state
    }

    fn trainer_slot(&mut self) -> &mut Option<DqnTrainer> {
        &mut self.trainer
    }

    fn run_feature_identification(
        &self,
        fetcher: &dyn DataFetcher,
        table: &TableSpec,
    ) -> Result<NormalizationDataMap> {
        let state = identify_state_features(fetcher, table, &self.config.preprocessing_options)?;
        Ok(NormalizationDataMap::from([(NormalizationKey::State, state)]))
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
            discrete_action: true,
            actions: self.actions().to_vec(),
            include_possible_actions: true,
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
            minibatch_size: self.config.trainer_param.minibatch_size,
            ..self.config.reader_options.clone()
        }
    }

    fn build_batch_preprocessor(&self) -> Result<DiscreteDqnBatchPreprocessor> {
        DiscreteDqnBatchPreprocessor::new(
            self.actions(),
            self.state_preprocessor("build_batch_preprocessor")?,
        )
    }

    fn create_reporter(&self) -> DiscreteDqnReporter {
        DiscreteDqnReporter::new(
            self.actions().to_vec(),
            self.config.target_action_distribution.clone(),
        )
    }

    fn build_trainer(&mut self) -> Result<DqnTrainer> {
        self.state
            .require("build_trainer", ManagerPhase::FeaturesIdentified)?;
        self.device.ensure_available()?;

        let state_data = self
            .state
            .normalization_data(NormalizationKey::State, "build_trainer")?;
        let mut q_network = self
            .net_builder
            .build_q_network(state_data, self.actions().len())?;
        q_network.place(self.device)?;

        let q_network = share(q_network);
        let trainer = DqnTrainer::new(q_network.clone(), self.config.trainer_param.clone())?;
        self.q_network = Some(q_network);
        self.state.advance(ManagerPhase::TrainerBuilt);

        counter!("rlkit_trainers_built_total", 1);
        info!(
            actions = self.actions().len(),
            device = %self.device,
            "built discrete DQN trainer"
        );
        Ok(trainer)
    }

    fn build_serving_module(&mut self) -> Result<DiscreteDqnServingModule> {
        self.state
            .require("build_serving_module", ManagerPhase::TrainerBuilt)?;
        let q_network = self.q_network()?;
        let module = self.net_builder.build_serving_module(
            &*read_network(&q_network)?,
            self.state
                .normalization_data(NormalizationKey::State, "build_serving_module")?,
            self.actions(),
            self.config.preprocessor_options,
        )?;
        self.state.advance(ManagerPhase::ServingModuleBuilt);
        Ok(module)
    }

    fn create_policy(&mut self, serving: bool) -> Result<DynPolicy> {
        if serving {
            let module = Arc::new(self.build_serving_module()?);
            return Ok(Policy::new(DiscreteDqnServingScorer::new(module), GreedyActionSampler).boxed());
        }
        self.state
            .require("create_policy", ManagerPhase::TrainerBuilt)?;
        let scorer = DiscreteDqnScorer::new(self.q_network()?, self.state_preprocessor("create_policy")?);
        let sampler = SoftmaxActionSampler::new(self.config.trainer_param.rl.temperature)?;
        Ok(Policy::new(scorer, sampler).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlkit_core::{NormalizationData, NormalizationParameters};
    use std::collections::BTreeMap;

    fn config(actions: &[&str]) -> DiscreteDqnConfig {
        DiscreteDqnConfig {
            trainer_param: DqnTrainerParameters {
                actions: actions.iter().map(|a| (*a).to_string()).collect(),
                ..DqnTrainerParameters::default()
            },
            ..DiscreteDqnConfig::default()
        }
    }

    fn state_map() -> NormalizationDataMap {
        let params = (1..=3)
            .map(|id| (id, NormalizationParameters::continuous(0.0, 1.0, -3.0, 3.0)))
            .collect::<BTreeMap<_, _>>();
        NormalizationDataMap::from([(NormalizationKey::State, NormalizationData::new(params))])
    }

    #[test]
    fn construction_validates_actions() {
        assert!(matches!(
            DiscreteDqn::new(config(&[]), false),
            Err(RLError::Configuration(_))
        ));
        let mismatched = DiscreteDqnConfig {
            target_action_distribution: Some(vec![1.0]),
            ..config(&["L", "R"])
        };
        assert!(matches!(
            DiscreteDqn::new(mismatched, false),
            Err(RLError::Configuration(_))
        ));
    }

    #[test]
    fn trainer_needs_features_and_an_available_device() {
        let mut manager = DiscreteDqn::new(config(&["L", "R"]), false).unwrap();
        assert!(matches!(manager.build_trainer(), Err(RLError::InvalidPhase { .. })));

        let mut gpu = DiscreteDqn::new(config(&["L", "R"]), true).unwrap();
        gpu.set_normalization_data_map(state_map()).unwrap();
        assert!(matches!(gpu.build_trainer(), Err(RLError::Configuration(_))));
        assert_eq!(gpu.phase(), ManagerPhase::FeaturesIdentified);

        manager.set_normalization_data_map(state_map()).unwrap();
        manager.initialize_trainer().unwrap();
        assert_eq!(manager.phase(), ManagerPhase::TrainerBuilt);
    }

    #[test]
    fn each_build_returns_an_independent_trainer() {
        let mut manager = DiscreteDqn::new(config(&["L", "R"]), false).unwrap();
        manager.set_normalization_data_map(state_map()).unwrap();
        let first = manager.build_trainer().unwrap();
        let second = manager.build_trainer().unwrap();
        assert!(!Arc::ptr_eq(&first.q_network(), &second.q_network()));
        assert!(Arc::ptr_eq(&second.q_network(), &manager.q_network().unwrap()));
    }

    #[test]
    fn serving_policy_is_greedy_over_actions() {
        let mut manager = DiscreteDqn::new(config(&["A", "B", "C"]), false).unwrap();
        manager.set_normalization_data_map(state_map()).unwrap();
        manager.initialize_trainer().unwrap();

        let policy = manager.create_policy(true).unwrap();
        assert_eq!(manager.phase(), ManagerPhase::ServingModuleBuilt);
        let obs = rlkit_core::FeatureData::from_rows(&[vec![0.1, 0.2, 0.3]]).unwrap();
        let out = policy.act(&obs).unwrap();
        assert_eq!(out.action.dim(), (1, 3));
        assert!(out.log_prob.iter().all(|&lp| lp == 0.0));
    }
}
