//! Policies composing a scorer with a sampler, and random baselines

use rlkit_core::{ActionSpace, ActorOutput, ContinuousActionRange, FeatureData, RLError, Result};

use crate::samplers::{
    ContinuousRandomSampler, DiscreteRandomSampler, GaussianSampler, GreedyActionSampler,
    Sampler, SoftmaxActionSampler,
};
use crate::scorers::{NullScorer, Scorer};

/// `act(obs) = sampler.sample_action(scorer.score(obs))`
#[derive(Debug, Clone)]
pub struct Policy<S = Box<dyn Scorer>, A = Box<dyn Sampler>> {
    scorer: S,
    sampler: A,
}

/// Policy with erased scorer and sampler types
pub type DynPolicy = Policy<Box<dyn Scorer>, Box<dyn Sampler>>;

impl<S: Scorer, A: Sampler> Policy<S, A> {
    /// Compose `scorer` and `sampler`
    pub fn new(scorer: S, sampler: A) -> Self {
        Self { scorer, sampler }
    }

    /// Select one action per observation row.
    ///
    /// Observations without a batch dimension are rejected before scoring.
    pub fn act(&self, observation: &FeatureData) -> Result<ActorOutput> {
        let batch_size = observation.batch_size()?;
        let scores = self.scorer.score(observation)?;
        if scores.batch_size() != batch_size {
            return Err(RLError::DimensionMismatch {
                expected: batch_size,
                actual: scores.batch_size(),
            });
        }
        self.sampler.sample_action(&scores)
    }

    /// Scorer half
    pub fn scorer(&self) -> &S {
        &self.scorer
    }

    /// Sampler half
    pub fn sampler(&self) -> &A {
        &self.sampler
    }

    /// Advance the sampler, e.g. decay its temperature
    pub fn update(&mut self) {
        self.sampler.update();
    }

    /// Erase the concrete types
    pub fn boxed(self) -> DynPolicy
    where
        S: 'static,
        A: 'static,
    {
        DynPolicy::new(Box::new(self.scorer), Box::new(self.sampler))
    }
}

/// Uniformly random discrete actions, one-hot encoded
pub type DiscreteRandomPolicy = Policy<NullScorer, DiscreteRandomSampler>;

impl Policy<NullScorer, DiscreteRandomSampler> {
    /// Random policy over `num_actions` actions
    pub fn with_num_actions(num_actions: usize) -> Result<Self> {
        Ok(Self::new(NullScorer, DiscreteRandomSampler::new(num_actions)?))
    }

    /// Random policy for a discrete action space
    pub fn create_for_env(action_space: &ActionSpace) -> Result<Self> {
        match action_space {
            ActionSpace::Discrete { n } => Self::with_num_actions(*n),
            ActionSpace::ContinuousBox { .. } => Err(RLError::UnsupportedActionSpace(
                "action space is continuous, use ContinuousRandomPolicy instead".to_string(),
            )),
            other => Err(RLError::UnsupportedActionSpace(format!(
                "{} action space has no discrete random policy",
                other.kind()
            ))),
        }
    }
}

/// Uniformly random actions inside fixed bounds
pub type ContinuousRandomPolicy = Policy<NullScorer, ContinuousRandomSampler>;

impl Policy<NullScorer, ContinuousRandomSampler> {
    /// Random policy over the box `[low, high]`
    pub fn with_bounds(low: Vec<f32>, high: Vec<f32>) -> Result<Self> {
        Ok(Self::new(NullScorer, ContinuousRandomSampler::new(low, high)?))
    }

    /// Random policy for a scalar continuous action space, sampling the
    /// training range
    pub fn create_for_env(
        action_space: &ActionSpace,
        range: ContinuousActionRange,
    ) -> Result<Self> {
        match action_space {
            ActionSpace::ContinuousBox { shape, .. } => {
                if shape.as_slice() != [1] {
                    return Err(RLError::Configuration(format!(
                        "continuous random policy only supports scalar actions, got shape {shape:?}"
                    )));
                }
                Self::with_bounds(vec![range.low], vec![range.high])
            }
            ActionSpace::Discrete { .. } => Err(RLError::UnsupportedActionSpace(
                "action space is discrete, use DiscreteRandomPolicy instead".to_string(),
            )),
            other => Err(RLError::UnsupportedActionSpace(format!(
                "{} action space has no continuous random policy",
                other.kind()
            ))),
        }
    }
}

/// Random policy matching the kind of `action_space`
pub fn make_random_policy_for_env(
    action_space: &ActionSpace,
    range: ContinuousActionRange,
) -> Result<DynPolicy> {
    match action_space {
        ActionSpace::Discrete { .. } => {
            Ok(DiscreteRandomPolicy::create_for_env(action_space)?.boxed())
        }
        ActionSpace::ContinuousBox { .. } => {
            Ok(ContinuousRandomPolicy::create_for_env(action_space, range)?.boxed())
        }
        other => Err(RLError::UnsupportedActionSpace(format!(
            "{} action space is not supported",
            other.kind()
        ))),
    }
}

/// How a policy built by [`make_policy_for_action_space`] selects actions
pub enum PolicyChoice {
    /// Ignore scores and act uniformly at random
    Random {
        /// Bounds for continuous random actions
        range: ContinuousActionRange,
    },
    /// Sample from the scorer's distribution: softmax over discrete scores
    /// at `temperature`, Gaussian sampling for continuous scores
    Explore {
        /// Scorer for the action space
        scorer: Box<dyn Scorer>,
        /// Softmax temperature for discrete spaces
        temperature: f32,
    },
    /// Take the best-scoring action
    Greedy {
        /// Scorer for the action space
        scorer: Box<dyn Scorer>,
    },
}

/// Resolve the sampler and scorer for `action_space` once, at construction.
///
/// Discrete spaces use a softmax or greedy sampler over categorical scores,
/// continuous boxes a Gaussian or greedy sampler. Any other kind fails with
/// [`RLError::UnsupportedActionSpace`] before a policy exists.
pub fn make_policy_for_action_space(
    action_space: &ActionSpace,
    choice: PolicyChoice,
) -> Result<DynPolicy> {
    match (action_space, choice) {
        (
            ActionSpace::Discrete { .. } | ActionSpace::ContinuousBox { .. },
            PolicyChoice::Random { range },
        ) => make_random_policy_for_env(action_space, range),
        (ActionSpace::Discrete { .. }, PolicyChoice::Explore { scorer, temperature }) => Ok(
            DynPolicy::new(scorer, Box::new(SoftmaxActionSampler::new(temperature)?)),
        ),
        (ActionSpace::ContinuousBox { .. }, PolicyChoice::Explore { scorer, .. }) => {
            Ok(DynPolicy::new(scorer, Box::new(GaussianSampler)))
        }
        (
            ActionSpace::Discrete { .. } | ActionSpace::ContinuousBox { .. },
            PolicyChoice::Greedy { scorer },
        ) => Ok(DynPolicy::new(scorer, Box::new(GreedyActionSampler))),
        (other, _) => Err(RLError::UnsupportedActionSpace(format!(
            "{} action space is not supported",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samplers::Scores;
    use ndarray::{arr1, arr2, Array2, Array3};
    use proptest::prelude::*;

    struct FixedScorer(Array2<f32>);

    impl Scorer for FixedScorer {
        fn score(&self, _observation: &FeatureData) -> Result<Scores> {
            Ok(Scores::Discrete(self.0.clone()))
        }
    }

    #[test]
    fn rank_one_observation_is_a_precondition_failure() {
        let policy = DiscreteRandomPolicy::with_num_actions(3).unwrap();
        let obs = FeatureData::new(arr1(&[1.0, 2.0]).into_dyn());
        assert!(matches!(policy.act(&obs), Err(RLError::Precondition(_))));
    }

    #[test]
    fn higher_rank_observations_use_the_first_axis() {
        let policy = DiscreteRandomPolicy::with_num_actions(2).unwrap();
        let obs = FeatureData::new(Array3::<f32>::zeros((4, 2, 2)).into_dyn());
        assert_eq!(policy.act(&obs).unwrap().action.dim(), (4, 2));
    }

    #[test]
    fn continuous_random_requires_scalar_actions() {
        let space = ActionSpace::continuous(vec![-1.0, -1.0], vec![1.0, 1.0]).unwrap();
        let err = ContinuousRandomPolicy::create_for_env(&space, ContinuousActionRange::default())
            .unwrap_err();
        assert!(matches!(err, RLError::Configuration(_)));
    }

    #[test]
    fn random_policies_reject_the_other_kind() {
        let continuous = ActionSpace::continuous(vec![-2.0], vec![2.0]).unwrap();
        assert!(matches!(
            DiscreteRandomPolicy::create_for_env(&continuous),
            Err(RLError::UnsupportedActionSpace(_))
        ));
        assert!(matches!(
            ContinuousRandomPolicy::create_for_env(
                &ActionSpace::discrete(2),
                ContinuousActionRange::default()
            ),
            Err(RLError::UnsupportedActionSpace(_))
        ));
    }

    #[test]
    fn multi_discrete_is_unsupported_at_construction() {
        let space = ActionSpace::MultiDiscrete { nvec: vec![2, 3] };
        let Err(err) = make_policy_for_action_space(
            &space,
            PolicyChoice::Greedy {
                scorer: Box::new(NullScorer),
            },
        ) else {
            panic!("multi-discrete spaces have no policy");
        };
        assert!(matches!(err, RLError::UnsupportedActionSpace(_)));
        assert!(matches!(
            make_random_policy_for_env(&space, ContinuousActionRange::default()),
            Err(RLError::UnsupportedActionSpace(_))
        ));
    }

    #[test]
    fn greedy_policy_over_discrete_space() {
        let policy = make_policy_for_action_space(
            &ActionSpace::discrete(3),
            PolicyChoice::Greedy {
                scorer: Box::new(FixedScorer(arr2(&[[0.0, 2.0, 1.0]]))),
            },
        )
        .unwrap();
        let out = policy
            .act(&FeatureData::from_batch(arr2(&[[0.0, 0.0]])))
            .unwrap();
        assert_eq!(out.action, arr2(&[[0.0, 1.0, 0.0]]));
    }

    #[test]
    fn scorer_batch_must_match_observation_batch() {
        let policy = Policy::new(FixedScorer(arr2(&[[0.0, 1.0]])), GreedyActionSampler);
        let obs = FeatureData::from_batch(arr2(&[[0.0], [1.0]]));
        assert!(matches!(
            policy.act(&obs),
            Err(RLError::DimensionMismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn discrete_random_policy_is_one_hot_with_uniform_log_prob(
            n in 1usize..10,
            batch in 1usize..16,
        ) {
            let policy = DiscreteRandomPolicy::create_for_env(&ActionSpace::discrete(n)).unwrap();
            let obs = FeatureData::from_batch(Array2::zeros((batch, 3)));
            let out = policy.act(&obs).unwrap();
            prop_assert_eq!(out.action.dim(), (batch, n));
            prop_assert_eq!(out.log_prob.len(), batch);
            for row in out.action.rows() {
                prop_assert!((row.sum() - 1.0).abs() < f32::EPSILON);
            }
            let expected = (1.0 / n as f32).ln();
            prop_assert!(out.log_prob.iter().all(|&lp| (lp - expected).abs() < 1e-6));
        }

        #[test]
        fn continuous_random_policy_stays_in_range(batch in 1usize..64) {
            let space = ActionSpace::continuous(vec![-2.0], vec![2.0]).unwrap();
            let range = ContinuousActionRange::default();
            let policy = ContinuousRandomPolicy::create_for_env(&space, range).unwrap();
            let out = policy.act(&FeatureData::from_batch(Array2::zeros((batch, 2)))).unwrap();
            prop_assert_eq!(out.action.dim(), (batch, 1));
            prop_assert!(out.action.iter().all(|&a| a >= range.low && a <= range.high));
        }
    }
}
