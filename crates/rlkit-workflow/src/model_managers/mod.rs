//! Model managers: per-algorithm orchestration of features, trainers and serving
//!
//! A manager moves through the phases of [`ManagerPhase`] in order. Every
//! operation checks the phase it needs and fails with
//! [`RLError::InvalidPhase`] when called too early.

pub mod cross_entropy_method;
pub mod discrete_dqn;
pub mod soft_actor_critic;
pub mod union;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use rlkit_core::{
    FeatureType, NormalizationData, NormalizationDataMap, NormalizationKey, RLError, Result,
};
use rlkit_gym::DynPolicy;
use rlkit_training::{BatchPreprocessor, SharedObserver, Trainer};

use crate::data_fetcher::{DataFetcher, FeatureColumn};
use crate::evaluator::Evaluator;
use crate::identify_types::identify_normalization_parameters;
use crate::reporters::Reporter;
use crate::train_and_evaluate::{train_and_evaluate_generic, ReporterHandles};
use crate::types::{Dataset, PreprocessingOptions, ReaderOptions, RewardOptions, RlTrainingOutput, TableSpec};

pub use cross_entropy_method::{CrossEntropyMethod, CrossEntropyMethodConfig};
pub use discrete_dqn::{DiscreteDqn, DiscreteDqnConfig};
pub use soft_actor_critic::{SoftActorCritic, SoftActorCriticConfig};
pub use union::{AnyModelManager, ModelManagerUnion};

/// Lifecycle phase of a model manager, in the order phases are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ManagerPhase {
    /// Configuration only, no networks
    Constructed,
    /// Normalization data is set
    FeaturesIdentified,
    /// Networks exist and a trainer was built
    TrainerBuilt,
    /// A serving module was built from the trained networks
    ServingModuleBuilt,
}

impl fmt::Display for ManagerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constructed => write!(f, "constructed"),
            Self::FeaturesIdentified => write!(f, "features identified"),
            Self::TrainerBuilt => write!(f, "trainer built"),
            Self::ServingModuleBuilt => write!(f, "serving module built"),
        }
    }
}

/// Phase plus the derived state every manager shares
#[derive(Debug, Clone)]
pub struct ManagerState {
    phase: ManagerPhase,
    normalization_data_map: Option<Arc<NormalizationDataMap>>,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerState {
    /// State of a freshly constructed manager
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: ManagerPhase::Constructed,
            normalization_data_map: None,
        }
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> ManagerPhase {
        self.phase
    }

    /// Fail unless `required` has been reached
    pub fn require(&self, operation: &str, required: ManagerPhase) -> Result<()> {
        if self.phase < required {
            return Err(RLError::invalid_phase(operation, required, self.phase));
        }
        Ok(())
    }

    /// Move forward to `phase`; never moves backwards
    pub fn advance(&mut self, phase: ManagerPhase) {
        self.phase = self.phase.max(phase);
    }

    /// Store normalization data; refused once networks were built from it
    pub fn set_normalization_data_map(&mut self, map: NormalizationDataMap) -> Result<()> {
        if self.phase >= ManagerPhase::TrainerBuilt {
            return Err(RLError::Precondition(format!(
                "normalization data cannot change once the {}",
                self.phase
            )));
        }
        self.normalization_data_map = Some(Arc::new(map));
        self.advance(ManagerPhase::FeaturesIdentified);
        Ok(())
    }

    /// Shared normalization data map
    pub fn normalization_data_map(&self, operation: &str) -> Result<Arc<NormalizationDataMap>> {
        self.require(operation, ManagerPhase::FeaturesIdentified)?;
        self.normalization_data_map
            .clone()
            .ok_or_else(|| RLError::invalid_phase(operation, ManagerPhase::FeaturesIdentified, self.phase))
    }

    /// Normalization data of one key
    pub fn normalization_data(
        &self,
        key: NormalizationKey,
        operation: &str,
    ) -> Result<&NormalizationData> {
        self.require(operation, ManagerPhase::FeaturesIdentified)?;
        self.normalization_data_map
            .as_deref()
            .and_then(|map| map.get(&key))
            .ok_or_else(|| {
                RLError::Precondition(format!("{operation} needs {key} normalization data"))
            })
    }
}

/// Per-algorithm orchestrator of configuration, training and serving.
///
/// Construction resolves configuration unions and builds no networks.
/// [`ModelManager::build_trainer`] may be called more than once; each call
/// returns an independent trainer and the manager keeps the networks of the
/// latest one.
pub trait ModelManager {
    /// Trainer this manager builds
    type Trainer: Trainer;
    /// Turns dataset rows into the trainer's batches
    type BatchPreprocessor: BatchPreprocessor<Output = <Self::Trainer as Trainer>::Batch>;
    /// Inference module over raw features
    type ServingModule;
    /// Reporter attached during [`ModelManager::train`]
    type Reporter: Reporter + 'static;

    /// Phase and normalization data
    fn state(&self) -> &ManagerState;

    /// Phase and normalization data, mutably
    fn state_mut(&mut self) -> &mut ManagerState;

    /// Slot holding the trainer created by [`ModelManager::initialize_trainer`]
    fn trainer_slot(&mut self) -> &mut Option<Self::Trainer>;

    /// Current phase
    fn phase(&self) -> ManagerPhase {
        self.state().phase()
    }

    /// Compute normalization data from a sample of `table`.
    ///
    /// Does not change the manager; the same table and options always
    /// yield the same map.
    fn run_feature_identification(
        &self,
        fetcher: &dyn DataFetcher,
        table: &TableSpec,
    ) -> Result<NormalizationDataMap>;

    /// Store normalization data and enter [`ManagerPhase::FeaturesIdentified`]
    fn set_normalization_data_map(&mut self, map: NormalizationDataMap) -> Result<()> {
        self.state_mut().set_normalization_data_map(map)
    }

    /// Query training rows with this algorithm's flags
    fn query_data(
        &self,
        fetcher: &dyn DataFetcher,
        table: &TableSpec,
        sample_range: Option<(f32, f32)>,
        reward_options: &RewardOptions,
    ) -> Result<Dataset>;

    /// Whether an evaluation dataset should be queried
    fn should_generate_eval_dataset(&self) -> bool;

    /// How datasets are cut into minibatches
    fn reader_options(&self) -> ReaderOptions;

    /// Batch preprocessor over the stored normalization data
    fn build_batch_preprocessor(&self) -> Result<Self::BatchPreprocessor>;

    /// Fresh reporter for one training run
    fn create_reporter(&self) -> Self::Reporter;

    /// Build networks and a trainer around them.
    ///
    /// Requires normalization data. Every network is placed on the
    /// configured device; an unavailable device is a configuration error.
    fn build_trainer(&mut self) -> Result<Self::Trainer>;

    /// Build a trainer and keep it for [`ModelManager::train`]
    fn initialize_trainer(&mut self) -> Result<()> {
        let trainer = self.build_trainer()?;
        *self.trainer_slot() = Some(trainer);
        Ok(())
    }

    /// The trainer kept by [`ModelManager::initialize_trainer`]
    fn trainer_mut(&mut self) -> Result<&mut Self::Trainer> {
        let phase = self.phase();
        self.trainer_slot()
            .as_mut()
            .ok_or_else(|| RLError::invalid_phase("trainer access", ManagerPhase::TrainerBuilt, phase))
    }

    /// Train for `num_epochs` epochs and report.
    ///
    /// A reporter is attached to the trainer and to a fresh evaluator for
    /// the duration of the run and detached afterwards, also on failure.
    /// The returned output has no `output_path`.
    fn train(
        &mut self,
        train_dataset: &Dataset,
        eval_dataset: Option<&Dataset>,
        num_epochs: usize,
    ) -> Result<RlTrainingOutput> {
        self.state().require("train", ManagerPhase::TrainerBuilt)?;
        let batch_preprocessor = self.build_batch_preprocessor()?;
        let reader_options = self.reader_options();
        let reporter = Arc::new(Mutex::new(self.create_reporter()));
        let observer: SharedObserver = reporter.clone();

        let mut evaluator = Evaluator::new();
        let trainer = self.trainer_mut()?;
        let handles = ReporterHandles {
            trainer: trainer.add_observer(observer.clone()),
            evaluator: evaluator.add_observer(observer),
        };
        let result = train_and_evaluate_generic(
            train_dataset,
            eval_dataset,
            &mut *trainer,
            num_epochs,
            &batch_preprocessor,
            &mut evaluator,
            handles,
            &reader_options,
        );
        trainer.remove_observer(handles.trainer);
        evaluator.remove_observer(handles.evaluator);
        result?;

        let report = reporter
            .lock()
            .map_err(|_| RLError::Computation("reporter lock poisoned".to_string()))?
            .generate_training_report();
        info!(num_epochs, rows = train_dataset.len(), "training finished");
        Ok(RlTrainingOutput::from_report(report))
    }

    /// Inference module over raw features; requires a built trainer
    fn build_serving_module(&mut self) -> Result<Self::ServingModule>;

    /// Policy for environment interaction.
    ///
    /// `serving` wraps a fresh serving module behind a greedy sampler;
    /// otherwise the policy reads the live training networks.
    fn create_policy(&mut self, serving: bool) -> Result<DynPolicy>;
}

/// Identify state features into a single-key map
pub(crate) fn identify_state_features(
    fetcher: &dyn DataFetcher,
    table: &TableSpec,
    options: &PreprocessingOptions,
) -> Result<NormalizationData> {
    Ok(NormalizationData::new(identify_normalization_parameters(
        fetcher,
        table,
        FeatureColumn::StateFeatures,
        options,
    )?))
}

/// Identify continuous action features, all typed as continuous actions
pub(crate) fn identify_continuous_action_features(
    fetcher: &dyn DataFetcher,
    table: &TableSpec,
    options: &PreprocessingOptions,
) -> Result<NormalizationData> {
    let sampled =
        fetcher.sample_feature_values(table, FeatureColumn::ActionFeatures, options.num_samples)?;
    let overrides: BTreeMap<_, _> = sampled
        .keys()
        .map(|&id| (id, FeatureType::ContinuousAction))
        .collect();
    let options = PreprocessingOptions {
        whitelist_features: None,
        feature_overrides: overrides,
        ..options.clone()
    };
    Ok(NormalizationData::new(identify_normalization_parameters(
        fetcher,
        table,
        FeatureColumn::ActionFeatures,
        &options,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_ordered() {
        assert!(ManagerPhase::Constructed < ManagerPhase::FeaturesIdentified);
        assert!(ManagerPhase::FeaturesIdentified < ManagerPhase::TrainerBuilt);
        assert!(ManagerPhase::TrainerBuilt < ManagerPhase::ServingModuleBuilt);
    }

    #[test]
    fn require_reports_both_phases() {
        let state = ManagerState::new();
        match state.require("build_serving_module", ManagerPhase::TrainerBuilt) {
            Err(RLError::InvalidPhase {
                operation,
                required,
                current,
            }) => {
                assert_eq!(operation, "build_serving_module");
                assert_eq!(required, "trainer built");
                assert_eq!(current, "constructed");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn normalization_data_is_frozen_after_trainer_build() {
        let mut state = ManagerState::new();
        assert!(state.normalization_data(NormalizationKey::State, "x").is_err());

        let map = NormalizationDataMap::from([(NormalizationKey::State, NormalizationData::default())]);
        state.set_normalization_data_map(map.clone()).unwrap();
        assert_eq!(state.phase(), ManagerPhase::FeaturesIdentified);
        assert!(state.normalization_data(NormalizationKey::State, "x").is_ok());
        assert!(matches!(
            state.normalization_data(NormalizationKey::Action, "x"),
            Err(RLError::Precondition(_))
        ));

        state.advance(ManagerPhase::TrainerBuilt);
        assert!(state.set_normalization_data_map(map).is_err());
        state.advance(ManagerPhase::FeaturesIdentified);
        assert_eq!(state.phase(), ManagerPhase::TrainerBuilt);
    }
}
