//! Reporters collecting trainer and evaluator callbacks into reports

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use rlkit_core::TrainingMetrics;
use rlkit_training::TrainingObserver;

use crate::types::RlTrainingReport;

const KL_EPSILON: f32 = 1e-8;

/// A training observer that can summarise what it saw
pub trait Reporter: TrainingObserver {
    /// Report of everything observed so far
    fn generate_training_report(&self) -> RlTrainingReport;
}

/// Metrics common to every report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// When the report was generated
    pub generated_at: DateTime<Utc>,
    /// Training steps observed
    pub num_minibatches: usize,
    /// Epochs completed
    pub num_epochs: usize,
    /// Mean of every training metric over all steps
    pub train_metric_means: IndexMap<String, f32>,
    /// Evaluation metrics, one entry per evaluation pass
    pub evaluations: Vec<TrainingMetrics>,
}

/// Running sums of training metrics plus the evaluation history
#[derive(Debug, Clone, Default)]
struct MetricHistory {
    num_minibatches: usize,
    num_epochs: usize,
    sums: IndexMap<String, (f64, usize)>,
    evaluations: Vec<TrainingMetrics>,
}

impl MetricHistory {
    fn record_step(&mut self, metrics: &TrainingMetrics) {
        self.num_minibatches += 1;
        for (key, value) in metrics {
            let entry = self.sums.entry(key.clone()).or_insert((0.0, 0));
            entry.0 += f64::from(*value);
            entry.1 += 1;
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn summary(&self) -> TrainingSummary {
        TrainingSummary {
            generated_at: Utc::now(),
            num_minibatches: self.num_minibatches,
            num_epochs: self.num_epochs,
            train_metric_means: self
                .sums
                .iter()
                .map(|(key, (sum, count))| (key.clone(), (sum / *count as f64) as f32))
                .collect(),
            evaluations: self.evaluations.clone(),
        }
    }
}

/// Report of a discrete DQN run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteDqnTrainingReport {
    /// Common metrics
    pub summary: TrainingSummary,
    /// Share of each action among the model's greedy choices at the last evaluation
    pub action_distribution: IndexMap<String, f32>,
    /// `KL(target || model)` per evaluation, when a target distribution is set
    pub kl_to_target: Vec<f32>,
}

/// Reporter for [`crate::DiscreteDqn`].
///
/// Besides the common metrics it tracks how often the model picks each
/// action and, given a target distribution, the KL divergence to it.
#[derive(Debug, Clone)]
pub struct DiscreteDqnReporter {
    actions: Vec<String>,
    target_action_distribution: Option<Vec<f32>>,
    history: MetricHistory,
    action_distribution: IndexMap<String, f32>,
    kl_to_target: Vec<f32>,
}

impl DiscreteDqnReporter {
    /// Reporter for `actions`; `target_action_distribution` must have one
    /// entry per action when given
    #[must_use]
    pub fn new(actions: Vec<String>, target_action_distribution: Option<Vec<f32>>) -> Self {
        Self {
            actions,
            target_action_distribution,
            history: MetricHistory::default(),
            action_distribution: IndexMap::new(),
            kl_to_target: Vec::new(),
        }
    }
}

/// `KL(target || model)`, with `model` floored to avoid infinities
#[must_use]
pub fn kl_divergence(target: &[f32], model: &[f32]) -> f32 {
    target
        .iter()
        .zip(model)
        .filter(|(p, _)| **p > 0.0)
        .map(|(p, q)| p * (p / q.max(KL_EPSILON)).ln())
        .sum()
}

impl TrainingObserver for DiscreteDqnReporter {
    fn on_train_step(&mut self, _minibatch: usize, metrics: &TrainingMetrics) {
        self.history.record_step(metrics);
    }

    fn on_evaluation(&mut self, _epoch: usize, metrics: &TrainingMetrics) {
        self.history.evaluations.push(metrics.clone());
        let shares: Vec<f32> = self
            .actions
            .iter()
            .map(|name| {
                metrics
                    .get(&format!("model_action_share/{name}"))
                    .copied()
                    .unwrap_or(0.0)
            })
            .collect();
        self.action_distribution = self.actions.iter().cloned().zip(shares.iter().copied()).collect();
        if let Some(target) = &self.target_action_distribution {
            self.kl_to_target.push(kl_divergence(target, &shares));
        }
    }

    fn on_epoch_end(&mut self, _epoch: usize) {
        self.history.num_epochs += 1;
    }
}

impl Reporter for DiscreteDqnReporter {
    fn generate_training_report(&self) -> RlTrainingReport {
        RlTrainingReport::DiscreteDqn(DiscreteDqnTrainingReport {
            summary: self.history.summary(),
            action_distribution: self.action_distribution.clone(),
            kl_to_target: self.kl_to_target.clone(),
        })
    }
}

/// Report of an actor-critic run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorCriticTrainingReport {
    /// Common metrics
    pub summary: TrainingSummary,
}

/// Reporter for actor-critic managers
#[derive(Debug, Clone, Default)]
pub struct ActorCriticReporter {
    history: MetricHistory,
}

impl ActorCriticReporter {
    /// Empty reporter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrainingObserver for ActorCriticReporter {
    fn on_train_step(&mut self, _minibatch: usize, metrics: &TrainingMetrics) {
        self.history.record_step(metrics);
    }

    fn on_evaluation(&mut self, _epoch: usize, metrics: &TrainingMetrics) {
        self.history.evaluations.push(metrics.clone());
    }

    fn on_epoch_end(&mut self, _epoch: usize) {
        self.history.num_epochs += 1;
    }
}

impl Reporter for ActorCriticReporter {
    fn generate_training_report(&self) -> RlTrainingReport {
        RlTrainingReport::ActorCritic(ActorCriticTrainingReport {
            summary: self.history.summary(),
        })
    }
}

/// Report of a world-model ensemble run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldModelTrainingReport {
    /// Common metrics
    pub summary: TrainingSummary,
    /// Running loss of each ensemble member at the last step
    pub model_cum_losses: Vec<f32>,
}

/// Reporter for world-model ensembles
#[derive(Debug, Clone, Default)]
pub struct WorldModelReporter {
    history: MetricHistory,
    model_cum_losses: Vec<f32>,
}

impl WorldModelReporter {
    /// Empty reporter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrainingObserver for WorldModelReporter {
    fn on_train_step(&mut self, _minibatch: usize, metrics: &TrainingMetrics) {
        self.history.record_step(metrics);
        self.model_cum_losses = (0..)
            .map_while(|i| metrics.get(&format!("model_{i}/cum_loss")).copied())
            .collect();
    }

    fn on_evaluation(&mut self, _epoch: usize, metrics: &TrainingMetrics) {
        self.history.evaluations.push(metrics.clone());
    }

    fn on_epoch_end(&mut self, _epoch: usize) {
        self.history.num_epochs += 1;
    }
}

impl Reporter for WorldModelReporter {
    fn generate_training_report(&self) -> RlTrainingReport {
        RlTrainingReport::WorldModel(WorldModelTrainingReport {
            summary: self.history.summary(),
            model_cum_losses: self.model_cum_losses.clone(),
        })
    }
}
