//! Scorers computing action scores from raw observations

use std::sync::Arc;

use ndarray::Array2;

use rlkit_core::{FeatureData, Result};
use rlkit_training::{
    read_network, ActorServingModule, CemPlannerNetwork, CemPlannerServingModule,
    DiscreteDqnServingModule, DiscreteQNetwork, GaussianActor, Preprocessor, SharedNetwork,
};

use crate::samplers::Scores;

/// Maps an observation batch to action scores
pub trait Scorer: Send + Sync {
    /// Score a batch of raw observations, one row each
    fn score(&self, observation: &FeatureData) -> Result<Scores>;
}

impl<S: Scorer + ?Sized> Scorer for Box<S> {
    fn score(&self, observation: &FeatureData) -> Result<Scores> {
        (**self).score(observation)
    }
}

/// Produces no scores, for samplers that ignore them
#[derive(Debug, Clone, Copy, Default)]
pub struct NullScorer;

impl Scorer for NullScorer {
    fn score(&self, observation: &FeatureData) -> Result<Scores> {
        Ok(Scores::Unscored {
            batch_size: observation.batch_size()?,
        })
    }
}

/// Q values of the live network being trained
#[derive(Debug, Clone)]
pub struct DiscreteDqnScorer {
    q_network: SharedNetwork<DiscreteQNetwork>,
    state_preprocessor: Preprocessor,
}

impl DiscreteDqnScorer {
    /// Score with `q_network` behind `state_preprocessor`
    #[must_use]
    pub fn new(q_network: SharedNetwork<DiscreteQNetwork>, state_preprocessor: Preprocessor) -> Self {
        Self {
            q_network,
            state_preprocessor,
        }
    }
}

impl Scorer for DiscreteDqnScorer {
    fn score(&self, observation: &FeatureData) -> Result<Scores> {
        let state = self.state_preprocessor.transform(&observation.to_batch()?)?;
        let q = read_network(&self.q_network)?.forward(&state)?;
        Ok(Scores::Discrete(q))
    }
}

/// Q values of a serving module snapshot
#[derive(Debug, Clone)]
pub struct DiscreteDqnServingScorer {
    module: Arc<DiscreteDqnServingModule>,
}

impl DiscreteDqnServingScorer {
    /// Score with `module`
    #[must_use]
    pub fn new(module: Arc<DiscreteDqnServingModule>) -> Self {
        Self { module }
    }
}

impl Scorer for DiscreteDqnServingScorer {
    fn score(&self, observation: &FeatureData) -> Result<Scores> {
        Ok(Scores::Discrete(
            self.module.q_values(&observation.to_batch()?)?,
        ))
    }
}

/// Gaussian parameters of the live actor, in the training action range
#[derive(Debug, Clone)]
pub struct ActorScorer {
    actor: SharedNetwork<GaussianActor>,
    state_preprocessor: Preprocessor,
}

impl ActorScorer {
    /// Score with `actor` behind `state_preprocessor`
    #[must_use]
    pub fn new(actor: SharedNetwork<GaussianActor>, state_preprocessor: Preprocessor) -> Self {
        Self {
            actor,
            state_preprocessor,
        }
    }
}

impl Scorer for ActorScorer {
    fn score(&self, observation: &FeatureData) -> Result<Scores> {
        let state = self.state_preprocessor.transform(&observation.to_batch()?)?;
        let (loc, scale_log) = read_network(&self.actor)?.forward(&state)?;
        Ok(Scores::Gaussian { loc, scale_log })
    }
}

/// Deterministic actions of an actor serving module, in action bounds
#[derive(Debug, Clone)]
pub struct ActorServingScorer {
    module: Arc<ActorServingModule>,
}

impl ActorServingScorer {
    /// Score with `module`
    #[must_use]
    pub fn new(module: Arc<ActorServingModule>) -> Self {
        Self { module }
    }
}

impl Scorer for ActorServingScorer {
    fn score(&self, observation: &FeatureData) -> Result<Scores> {
        Ok(Scores::Deterministic(
            self.module.act(&observation.to_batch()?)?,
        ))
    }
}

fn planned_scores(discrete: bool, actions: Array2<f32>) -> Scores {
    if discrete {
        Scores::Discrete(actions)
    } else {
        Scores::Deterministic(actions)
    }
}

/// First planned action of a live CEM planner.
///
/// Discrete plans come back one-hot and are scored as such, so a greedy
/// sampler reproduces the plan.
#[derive(Debug, Clone)]
pub struct CemPlannerScorer {
    planner: Arc<CemPlannerNetwork>,
    state_preprocessor: Preprocessor,
}

impl CemPlannerScorer {
    /// Plan with `planner` behind `state_preprocessor`
    #[must_use]
    pub fn new(planner: Arc<CemPlannerNetwork>, state_preprocessor: Preprocessor) -> Self {
        Self {
            planner,
            state_preprocessor,
        }
    }
}

impl Scorer for CemPlannerScorer {
    fn score(&self, observation: &FeatureData) -> Result<Scores> {
        let state = self.state_preprocessor.transform(&observation.to_batch()?)?;
        let actions = self.planner.plan(&state)?;
        Ok(planned_scores(self.planner.is_discrete(), actions))
    }
}

/// First planned action of a CEM serving module
#[derive(Debug, Clone)]
pub struct CemPlannerServingScorer {
    module: Arc<CemPlannerServingModule>,
}

impl CemPlannerServingScorer {
    /// Plan with `module`
    #[must_use]
    pub fn new(module: Arc<CemPlannerServingModule>) -> Self {
        Self { module }
    }
}

impl Scorer for CemPlannerServingScorer {
    fn score(&self, observation: &FeatureData) -> Result<Scores> {
        let actions = self.module.plan(&observation.to_batch()?)?;
        Ok(planned_scores(self.module.is_discrete(), actions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rlkit_core::{NormalizationData, NormalizationParameters};
    use rlkit_training::{share, Activation, FullyConnectedNetwork, PreprocessorOptions};
    use std::collections::BTreeMap;

    fn preprocessor(features: i64) -> Preprocessor {
        let params: BTreeMap<_, _> = (0..features)
            .map(|id| (id, NormalizationParameters::continuous(0.0, 1.0, -3.0, 3.0)))
            .collect();
        Preprocessor::new(&NormalizationData::new(params), PreprocessorOptions::default())
            .unwrap()
    }

    #[test]
    fn null_scorer_reports_batch_size_only() {
        let obs = FeatureData::from_batch(arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]));
        assert_eq!(
            NullScorer.score(&obs).unwrap(),
            Scores::Unscored { batch_size: 3 }
        );
    }

    #[test]
    fn live_dqn_scorer_sees_weight_updates() {
        let body = FullyConnectedNetwork::new(3, &[4], &[Activation::Relu], 2).unwrap();
        let q = share(DiscreteQNetwork::fully_connected(body, 2).unwrap());
        let scorer = DiscreteDqnScorer::new(q.clone(), preprocessor(3));
        let obs = FeatureData::from_batch(arr2(&[[0.5, -0.5, 1.0]]));
        let before = scorer.score(&obs).unwrap();

        for layer in q.write().unwrap().body_mut().layers_mut() {
            layer.bias.fill(5.0);
        }
        assert_ne!(scorer.score(&obs).unwrap(), before);
    }

    #[test]
    fn actor_scorer_emits_gaussian_parameters() {
        let body = FullyConnectedNetwork::new(2, &[4], &[Activation::Tanh], 2).unwrap();
        let actor = share(GaussianActor::new(body, 1, -5.0, 2.0).unwrap());
        let scorer = ActorScorer::new(actor, preprocessor(2));
        let scores = scorer
            .score(&FeatureData::from_batch(arr2(&[[0.0, 1.0], [1.0, 0.0]])))
            .unwrap();
        match scores {
            Scores::Gaussian { loc, scale_log } => {
                assert_eq!(loc.dim(), (2, 1));
                assert!(scale_log.iter().all(|v| (-5.0..=2.0).contains(v)));
            }
            other => panic!("unexpected scores {other:?}"),
        }
    }
}
