mod common;

use std::sync::{Arc, Mutex};

use rlkit_core::{FeatureData, NormalizationKey, RLError};
use rlkit_training::{
    BatchPreprocessor, CemTrainerParameters, DqnTrainerParameters, SharedObserver, Trainer,
    TrainingObserver, WorldModelParameters,
};
use rlkit_workflow::{
    train_and_evaluate_generic, CrossEntropyMethod, CrossEntropyMethodConfig, DiscreteDqn,
    DiscreteDqnConfig, DiscreteDqnReporter, Evaluator, ManagerPhase, ModelManager, ReaderOptions,
    ReporterHandles, RewardOptions, RlTrainingReport, SoftActorCritic, SoftActorCriticConfig,
    TableSpec,
};

use common::{action_names, discrete_fetcher, ACTIONS};

const TABLE: &str = "synthetic";

fn dqn_manager() -> DiscreteDqn {
    let config = DiscreteDqnConfig {
        trainer_param: DqnTrainerParameters {
            actions: action_names(),
            minibatch_size: 16,
            ..DqnTrainerParameters::default()
        },
        ..DiscreteDqnConfig::default()
    };
    DiscreteDqn::new(config, false).unwrap()
}

fn cem_manager(num_world_models: usize) -> CrossEntropyMethod {
    let config = CrossEntropyMethodConfig {
        trainer_param: CemTrainerParameters {
            num_world_models,
            plan_horizon_length: 2,
            cem_population_size: 8,
            cem_num_iterations: 2,
            num_elites: 2,
            mdnrnn: WorldModelParameters {
                hidden_sizes: vec![8],
                minibatch_size: 16,
                ..WorldModelParameters::default()
            },
            ..CemTrainerParameters::default()
        },
        discrete_actions: action_names(),
        ..CrossEntropyMethodConfig::default()
    };
    CrossEntropyMethod::new(config, false).unwrap()
}

fn identify<M: ModelManager>(manager: &mut M) {
    let fetcher = discrete_fetcher(TABLE);
    let map = manager
        .run_feature_identification(&fetcher, &TableSpec::new(TABLE))
        .unwrap();
    manager.set_normalization_data_map(map).unwrap();
}

#[test]
fn exploration_policy_acts_on_a_batch_end_to_end() {
    let mut manager = dqn_manager();
    identify(&mut manager);
    assert_eq!(manager.phase(), ManagerPhase::FeaturesIdentified);
    let state = manager
        .state()
        .normalization_data(NormalizationKey::State, "test")
        .unwrap();
    assert_eq!(state.num_features(), 3);

    manager.initialize_trainer().unwrap();
    let policy = manager.create_policy(false).unwrap();
    let observations =
        FeatureData::from_rows(&[vec![0.5, 2.0, -3.0], vec![-1.0, 4.5, 12.0]]).unwrap();
    let output = policy.act(&observations).unwrap();

    assert_eq!(output.action.dim(), (2, ACTIONS.len()));
    for row in output.action.rows() {
        assert_eq!(row.iter().filter(|&&v| v == 1.0).count(), 1);
        assert_eq!(row.iter().filter(|&&v| v == 0.0).count(), ACTIONS.len() - 1);
    }
    assert_eq!(output.log_prob.len(), 2);
    assert!(output.log_prob.iter().all(|lp| *lp <= 0.0));
}

#[test]
fn serving_module_requires_a_built_trainer() {
    let mut dqn = dqn_manager();
    assert!(matches!(dqn.build_serving_module(), Err(RLError::InvalidPhase { .. })));
    identify(&mut dqn);
    assert!(matches!(dqn.build_serving_module(), Err(RLError::InvalidPhase { .. })));
    assert!(matches!(dqn.create_policy(true), Err(RLError::InvalidPhase { .. })));

    let mut sac = SoftActorCritic::new(SoftActorCriticConfig::default(), false).unwrap();
    assert!(matches!(sac.build_serving_module(), Err(RLError::InvalidPhase { .. })));

    let mut cem = cem_manager(1);
    assert!(matches!(cem.build_serving_module(), Err(RLError::InvalidPhase { .. })));
    assert!(matches!(cem.create_policy(false), Err(RLError::InvalidPhase { .. })));
}

#[test]
fn feature_identification_is_idempotent() {
    let manager = dqn_manager();
    let fetcher = discrete_fetcher(TABLE);
    let table = TableSpec::new(TABLE);
    let first = manager.run_feature_identification(&fetcher, &table).unwrap();
    let second = manager.run_feature_identification(&fetcher, &table).unwrap();
    assert_eq!(first, second);
    assert_eq!(manager.phase(), ManagerPhase::Constructed);
}

#[test]
fn training_reports_and_detaches_the_reporter() {
    let mut manager = dqn_manager();
    identify(&mut manager);
    let fetcher = discrete_fetcher(TABLE);
    let table = TableSpec::new(TABLE);
    let rewards = RewardOptions::default();
    let train = manager
        .query_data(&fetcher, &table, Some((0.0, 80.0)), &rewards)
        .unwrap();
    let eval = manager
        .query_data(&fetcher, &table, Some((80.0, 100.0)), &rewards)
        .unwrap();
    assert_eq!(train.len() + eval.len(), 96);
    // episode-1 is the only episode hashed into the upper fifth
    assert_eq!(eval.len(), 8);

    assert!(matches!(
        manager.train(&train, Some(&eval), 1),
        Err(RLError::InvalidPhase { .. })
    ));
    manager.initialize_trainer().unwrap();
    let output = manager.train(&train, Some(&eval), 2).unwrap();

    assert_eq!(output.output_path, None);
    let Some(RlTrainingReport::DiscreteDqn(report)) = output.training_report else {
        panic!("expected a discrete DQN report");
    };
    assert_eq!(report.summary.num_epochs, 2);
    assert_eq!(report.summary.num_minibatches, 2 * train.len().div_ceil(16));
    assert!(report.summary.train_metric_means.contains_key("td_loss"));
    assert_eq!(report.summary.evaluations.len(), 2);
    let share: f32 = report.action_distribution.values().sum();
    assert!((share - 1.0).abs() < 1e-4);
    assert!(manager.trainer_mut().unwrap().observers().is_empty());
}

#[test]
fn each_training_run_reports_only_its_own_steps() {
    let mut manager = dqn_manager();
    identify(&mut manager);
    let train = manager
        .query_data(
            &discrete_fetcher(TABLE),
            &TableSpec::new(TABLE),
            None,
            &RewardOptions::default(),
        )
        .unwrap();
    manager.initialize_trainer().unwrap();
    let per_epoch = train.len().div_ceil(16);

    for run in 1..=2 {
        let output = manager.train(&train, None, 1).unwrap();
        let Some(RlTrainingReport::DiscreteDqn(report)) = output.training_report else {
            panic!("expected a discrete DQN report");
        };
        assert_eq!(report.summary.num_minibatches, per_epoch);
        assert_eq!(manager.trainer_mut().unwrap().minibatch(), run * per_epoch);
    }
}

#[test]
fn training_loop_requires_an_attached_reporter() {
    let mut manager = dqn_manager();
    identify(&mut manager);
    let fetcher = discrete_fetcher(TABLE);
    let dataset = manager
        .query_data(&fetcher, &TableSpec::new(TABLE), None, &RewardOptions::default())
        .unwrap();
    let preprocessor = manager.build_batch_preprocessor().unwrap();
    let mut trainer = manager.build_trainer().unwrap();
    let mut evaluator = Evaluator::new();

    let reporter: SharedObserver =
        Arc::new(Mutex::new(DiscreteDqnReporter::new(action_names(), None)));
    let stale = trainer.add_observer(reporter.clone());
    trainer.remove_observer(stale);
    let attached = evaluator.add_observer(reporter);

    let result = train_and_evaluate_generic(
        &dataset,
        None,
        &mut trainer,
        1,
        &preprocessor,
        &mut evaluator,
        ReporterHandles {
            trainer: stale,
            evaluator: attached,
        },
        &ReaderOptions::default(),
    );
    assert!(matches!(result, Err(RLError::Precondition(_))));
    assert_eq!(trainer.minibatch(), 0);
}

#[derive(Default)]
struct StepCounter {
    steps: usize,
}

impl TrainingObserver for StepCounter {
    fn on_train_step(&mut self, _minibatch: usize, _metrics: &rlkit_core::TrainingMetrics) {
        self.steps += 1;
    }
}

#[test]
fn ensemble_step_counts_once_whatever_the_ensemble_size() {
    let fetcher = discrete_fetcher(TABLE);
    for num_world_models in [1, 5] {
        let mut manager = cem_manager(num_world_models);
        identify(&mut manager);
        let dataset = manager
            .query_data(&fetcher, &TableSpec::new(TABLE), None, &RewardOptions::default())
            .unwrap();
        let batch = manager
            .build_batch_preprocessor()
            .unwrap()
            .preprocess(&dataset.rows[..16])
            .unwrap();
        let mut trainer = manager.build_trainer().unwrap();
        let counter = Arc::new(Mutex::new(StepCounter::default()));
        trainer.add_observer(counter.clone());

        let before = trainer.minibatch();
        let metrics = trainer.train(batch).unwrap();
        assert_eq!(trainer.minibatch() - before, 1);
        assert_eq!(counter.lock().unwrap().steps, 1);
        for i in 0..num_world_models {
            assert!(metrics.contains_key(&format!("model_{i}/loss")));
        }
    }
}

#[test]
fn unavailable_device_fails_when_building_the_trainer() {
    let config = DiscreteDqnConfig {
        trainer_param: DqnTrainerParameters {
            actions: action_names(),
            ..DqnTrainerParameters::default()
        },
        ..DiscreteDqnConfig::default()
    };
    let mut manager = DiscreteDqn::new(config, true).unwrap();
    identify(&mut manager);
    assert!(matches!(manager.build_trainer(), Err(RLError::Configuration(_))));
    assert_eq!(manager.phase(), ManagerPhase::FeaturesIdentified);
}
