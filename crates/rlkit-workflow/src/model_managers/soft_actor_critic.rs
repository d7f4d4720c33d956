//! Soft Actor-Critic model manager

use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use rlkit_core::{NormalizationDataMap, NormalizationKey, RLError, Result};
use rlkit_gym::{
    ActorScorer, ActorServingScorer, DynPolicy, GaussianSampler, GreedyActionSampler, Policy,
};
use rlkit_training::net_builder::{
    ContinuousActorNetBuilder, ParametricDqnNetBuilder, ValueNetBuilder,
};
use rlkit_training::{
    read_network, share, ActorServingModule, ContinuousActorNetBuilderUnion, Device,
    GaussianActor, ParametricDqnNetBuilderUnion, PolicyNetworkBatchPreprocessor, Preprocessor,
    PreprocessorOptions, SacNetworks, SacTrainer, SacTrainerParameters, SharedNetwork,
    ValueNetBuilderUnion,
};

use super::{
    identify_continuous_action_features, identify_state_features, ManagerPhase, ManagerState,
    ModelManager,
};
use crate::data_fetcher::{DataFetcher, QueryDataParams};
use crate::reporters::ActorCriticReporter;
use crate::types::{
    Dataset, EvaluationParameters, PreprocessingOptions, ReaderOptions, RewardOptions, TableSpec,
};

/// Configuration of [`SoftActorCritic`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftActorCriticConfig {
    /// Trainer parameters
    pub trainer_param: SacTrainerParameters,
    /// Actor architecture
    pub actor_net_builder: ContinuousActorNetBuilderUnion,
    /// Critic architecture, shared by both critics
    pub critic_net_builder: ParametricDqnNetBuilderUnion,
    /// State-value network; `None` bootstraps from the target critics
    pub value_net_builder: Option<ValueNetBuilderUnion>,
    /// Train twin critics and bootstrap from their minimum
    pub use_2_q_functions: bool,
    /// State feature identification
    pub state_preprocessing_options: PreprocessingOptions,
    /// Action feature identification; every action feature is a continuous action
    pub action_preprocessing_options: PreprocessingOptions,
    /// Minibatch shuffling; the size follows `trainer_param.minibatch_size`
    pub reader_options: ReaderOptions,
    /// Evaluation during training
    pub eval_parameters: EvaluationParameters,
    /// Feature scaling and the action training range
    pub preprocessor_options: PreprocessorOptions,
}

impl Default for SoftActorCriticConfig {
    fn default() -> Self {
        Self {
            trainer_param: SacTrainerParameters::default(),
            actor_net_builder: ContinuousActorNetBuilderUnion::default(),
            critic_net_builder: ParametricDqnNetBuilderUnion::default(),
            value_net_builder: Some(ValueNetBuilderUnion::default()),
            use_2_q_functions: true,
            state_preprocessing_options: PreprocessingOptions::default(),
            action_preprocessing_options: PreprocessingOptions::default(),
            reader_options: ReaderOptions::default(),
            eval_parameters: EvaluationParameters::default(),
            preprocessor_options: PreprocessorOptions::default(),
        }
    }
}

/// Trains a Gaussian policy with soft Q-learning critics
pub struct SoftActorCritic {
    config: SoftActorCriticConfig,
    actor_net_builder: Arc<dyn ContinuousActorNetBuilder>,
    critic_net_builder: Arc<dyn ParametricDqnNetBuilder>,
    value_net_builder: Option<Arc<dyn ValueNetBuilder>>,
    device: Device,
    state: ManagerState,
    actor: Option<SharedNetwork<GaussianActor>>,
    trainer: Option<SacTrainer>,
}

impl SoftActorCritic {
    /// Resolve the network builders
    pub fn new(config: SoftActorCriticConfig, use_gpu: bool) -> Result<Self> {
        let actor_net_builder = config.actor_net_builder.value()?;
        let critic_net_builder = config.critic_net_builder.value()?;
        let value_net_builder = config
            .value_net_builder
            .as_ref()
            .map(ValueNetBuilderUnion::value)
            .transpose()?;
        Ok(Self {
            actor_net_builder,
            critic_net_builder,
            value_net_builder,
            device: Device::from_use_gpu(use_gpu),
            state: ManagerState::new(),
            actor: None,
            trainer: None,
            config,
        })
    }

    /// Live actor of the latest built trainer
    pub fn actor(&self) -> Result<SharedNetwork<GaussianActor>> {
        self.actor.clone().ok_or_else(|| {
            RLError::invalid_phase("actor", ManagerPhase::TrainerBuilt, self.state.phase())
        })
    }

    fn preprocessor(&self, key: NormalizationKey, operation: &str) -> Result<Preprocessor> {
        Preprocessor::new(
            self.state.normalization_data(key, operation)?,
            self.config.preprocessor_options,
        )
    }
}

impl ModelManager for SoftActorCritic {
    type Trainer = SacTrainer;
    type BatchPreprocessor = PolicyNetworkBatchPreprocessor;
    type ServingModule = ActorServingModule;
    type Reporter = ActorCriticReporter;

    fn state(&self) -> &ManagerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ManagerState {
        &mut self.state
    }

    fn trainer_slot(&mut self) -> &mut Option<SacTrainer> {
        &mut self.trainer
    }

    fn run_feature_identification(
        &self,
        fetcher: &dyn DataFetcher,
        table: &TableSpec,
    ) -> Result<NormalizationDataMap> {
        let state =
            identify_state_features(fetcher, table, &self.config.state_preprocessing_options)?;
        let action = identify_continuous_action_features(
            fetcher,
            table,
            &self.config.action_preprocessing_options,
        )?;
        Ok(NormalizationDataMap::from([
            (NormalizationKey::State, state),
            (NormalizationKey::Action, action),
        ]))
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
            discrete_action: false,
            actions: Vec::new(),
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
            minibatch_size: self.config.trainer_param.minibatch_size,
            ..self.config.reader_options.clone()
        }
    }

    fn build_batch_preprocessor(&self) -> Result<PolicyNetworkBatchPreprocessor> {
        let operation = "build_batch_preprocessor";
        Ok(PolicyNetworkBatchPreprocessor::new(
            self.preprocessor(NormalizationKey::State, operation)?,
            self.preprocessor(NormalizationKey::Action, operation)?,
        ))
    }

    fn create_reporter(&self) -> ActorCriticReporter {
        ActorCriticReporter::new()
    }

    fn build_trainer(&mut self) -> Result<SacTrainer> {
        let operation = "build_trainer";
        self.state.require(operation, ManagerPhase::FeaturesIdentified)?;
        self.device.ensure_available()?;

        let state_data = self.state.normalization_data(NormalizationKey::State, operation)?;
        let action_data = self.state.normalization_data(NormalizationKey::Action, operation)?;

        let mut actor = self.actor_net_builder.build_actor(state_data, action_data)?;
        actor.place(self.device)?;
        let mut q1 = self.critic_net_builder.build_q_network(state_data, action_data)?;
        q1.place(self.device)?;
        let q2 = if self.config.use_2_q_functions {
            let mut q2 = self.critic_net_builder.build_q_network(state_data, action_data)?;
            q2.place(self.device)?;
            Some(q2)
        } else {
            None
        };
        let value = match &self.value_net_builder {
            Some(builder) => {
                let mut value = builder.build_value_network(state_data)?;
                value.place(self.device)?;
                Some(value)
            }
            None => None,
        };

        let actor = share(actor);
        let trainer = SacTrainer::new(
            SacNetworks {
                actor: actor.clone(),
                q1,
                q2,
                value,
            },
            self.config.trainer_param.clone(),
        )?;
        self.actor = Some(actor);
        self.state.advance(ManagerPhase::TrainerBuilt);

        counter!("rlkit_trainers_built_total", 1);
        info!(
            twin_critics = trainer.uses_twin_critics(),
            value_network = trainer.uses_value_network(),
            device = %self.device,
            "built soft actor-critic trainer"
        );
        Ok(trainer)
    }

    fn build_serving_module(&mut self) -> Result<ActorServingModule> {
        let operation = "build_serving_module";
        self.state.require(operation, ManagerPhase::TrainerBuilt)?;
        let actor = self.actor()?;
        let module = self.actor_net_builder.build_serving_module(
            &*read_network(&actor)?,
            self.state.normalization_data(NormalizationKey::State, operation)?,
            self.state.normalization_data(NormalizationKey::Action, operation)?,
            self.config.preprocessor_options,
        )?;
        self.state.advance(ManagerPhase::ServingModuleBuilt);
        Ok(module)
    }

    fn create_policy(&mut self, serving: bool) -> Result<DynPolicy> {
        if serving {
            let module = Arc::new(self.build_serving_module()?);
            return Ok(Policy::new(ActorServingScorer::new(module), GreedyActionSampler).boxed());
        }
        self.state.require("create_policy", ManagerPhase::TrainerBuilt)?;
        let scorer = ActorScorer::new(
            self.actor()?,
            self.preprocessor(NormalizationKey::State, "create_policy")?,
        );
        Ok(Policy::new(scorer, GaussianSampler).boxed())
    }
}
