//! End-to-end training driver

use tracing::{info, info_span};

use rlkit_core::Result;

use crate::config::WorkflowConfig;
use crate::data_fetcher::DataFetcher;
use crate::model_managers::{AnyModelManager, ModelManager};
use crate::types::RlTrainingOutput;

/// A trained manager together with its training output
pub struct TrainedWorkflow {
    /// Manager after training, ready to build serving modules and policies
    pub manager: AnyModelManager,
    /// Report of the run
    pub output: RlTrainingOutput,
}

/// Resolve the configured manager and run feature identification, data
/// queries, trainer construction and training
pub fn train_workflow(config: &WorkflowConfig, fetcher: &dyn DataFetcher) -> Result<TrainedWorkflow> {
    let mut manager = config.model.value(config.use_gpu)?;
    let span = info_span!("train_workflow", model = manager.name());
    let _guard = span.enter();

    let output = match &mut manager {
        AnyModelManager::DiscreteDqn(m) => run_phases(m, config, fetcher)?,
        AnyModelManager::SoftActorCritic(m) => run_phases(m, config, fetcher)?,
        AnyModelManager::CrossEntropyMethod(m) => run_phases(m, config, fetcher)?,
    };
    Ok(TrainedWorkflow { manager, output })
}

fn run_phases<M: ModelManager>(
    manager: &mut M,
    config: &WorkflowConfig,
    fetcher: &dyn DataFetcher,
) -> Result<RlTrainingOutput> {
    let table = &config.input_table_spec;

    let normalization = manager.run_feature_identification(fetcher, table)?;
    manager.set_normalization_data_map(normalization)?;
    info!(table = %table.table_name, "features identified");

    let train_dataset =
        manager.query_data(fetcher, table, config.train_sample_range, &config.reward_options)?;
    let eval_dataset = if manager.should_generate_eval_dataset() {
        Some(manager.query_data(fetcher, table, config.eval_sample_range, &config.reward_options)?)
    } else {
        None
    };
    info!(
        train_rows = train_dataset.len(),
        eval_rows = eval_dataset.as_ref().map_or(0, |d| d.len()),
        "datasets queried"
    );

    manager.initialize_trainer()?;
    manager.train(&train_dataset, eval_dataset.as_ref(), config.num_train_epochs)
}
