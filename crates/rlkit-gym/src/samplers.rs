//! Samplers turning action scores into actions and log-probabilities

use std::fmt;

use ndarray::{Array1, Array2, Axis};
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use statrs::distribution::{Continuous, Normal};

use rlkit_core::{ActorOutput, RLError, Result};
use rlkit_training::preprocessing::argmax;
use rlkit_training::utils::{sample_categorical, softmax, Schedule};

/// Raw action scores produced by a scorer.
///
/// Every variant holds one row per observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Scores {
    /// One score per discrete action, `(batch, num_actions)`
    Discrete(Array2<f32>),
    /// Parameters of a diagonal Gaussian, each `(batch, action_dim)`
    Gaussian {
        /// Mean
        loc: Array2<f32>,
        /// Log standard deviation
        scale_log: Array2<f32>,
    },
    /// Actions already chosen by the scorer, `(batch, action_dim)`
    Deterministic(Array2<f32>),
    /// No scores; only the batch size is known
    Unscored {
        /// Number of observations
        batch_size: usize,
    },
}

impl Scores {
    /// Number of rows
    #[must_use]
    pub fn batch_size(&self) -> usize {
        match self {
            Self::Discrete(scores) => scores.nrows(),
            Self::Gaussian { loc, .. } => loc.nrows(),
            Self::Deterministic(actions) => actions.nrows(),
            Self::Unscored { batch_size } => *batch_size,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Discrete(_) => "discrete",
            Self::Gaussian { .. } => "gaussian",
            Self::Deterministic(_) => "deterministic",
            Self::Unscored { .. } => "unscored",
        }
    }
}

/// Selects actions from scores.
///
/// `sample_action` draws from the thread-local generator; the `_with_rng`
/// variant makes draws reproducible.
pub trait Sampler: Send + Sync {
    /// Sample one action per row of `scores`
    fn sample_action(&self, scores: &Scores) -> Result<ActorOutput> {
        self.sample_action_with_rng(scores, &mut rand::thread_rng())
    }

    /// Sample with an explicit random source
    fn sample_action_with_rng(&self, scores: &Scores, rng: &mut dyn RngCore)
        -> Result<ActorOutput>;

    /// Log-probability of `action` under the distribution `scores` induce
    fn log_prob(&self, scores: &Scores, action: &Array2<f32>) -> Result<Array1<f32>>;

    /// Advance internal parameters such as a decaying temperature
    fn update(&mut self) {}
}

impl<S: Sampler + ?Sized> Sampler for Box<S> {
    fn sample_action(&self, scores: &Scores) -> Result<ActorOutput> {
        (**self).sample_action(scores)
    }

    fn sample_action_with_rng(
        &self,
        scores: &Scores,
        rng: &mut dyn RngCore,
    ) -> Result<ActorOutput> {
        (**self).sample_action_with_rng(scores, rng)
    }

    fn log_prob(&self, scores: &Scores, action: &Array2<f32>) -> Result<Array1<f32>> {
        (**self).log_prob(scores, action)
    }

    fn update(&mut self) {
        (**self).update();
    }
}

fn unexpected(sampler: &str, scores: &Scores) -> RLError {
    RLError::Policy(format!(
        "{sampler} cannot sample from {} scores",
        scores.kind()
    ))
}

fn check_action_shape(action: &Array2<f32>, batch_size: usize, width: usize) -> Result<()> {
    if action.nrows() != batch_size {
        return Err(RLError::DimensionMismatch {
            expected: batch_size,
            actual: action.nrows(),
        });
    }
    if action.ncols() != width {
        return Err(RLError::DimensionMismatch {
            expected: width,
            actual: action.ncols(),
        });
    }
    Ok(())
}

fn one_hot(indices: &[usize], num_actions: usize) -> Array2<f32> {
    let mut action = Array2::zeros((indices.len(), num_actions));
    for (row, &index) in indices.iter().enumerate() {
        action[[row, index]] = 1.0;
    }
    action
}

/// Picks the best-scoring action; for Gaussian scores, the mean
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyActionSampler;

impl Sampler for GreedyActionSampler {
    fn sample_action_with_rng(
        &self,
        scores: &Scores,
        _rng: &mut dyn RngCore,
    ) -> Result<ActorOutput> {
        let action = match scores {
            Scores::Discrete(q) => {
                let indices: Vec<usize> = q.rows().into_iter().map(argmax).collect();
                one_hot(&indices, q.ncols())
            }
            Scores::Gaussian { loc, .. } => loc.clone(),
            Scores::Deterministic(actions) => actions.clone(),
            Scores::Unscored { .. } => return Err(unexpected("greedy sampler", scores)),
        };
        Ok(ActorOutput {
            log_prob: Array1::zeros(action.nrows()),
            action,
        })
    }

    fn log_prob(&self, scores: &Scores, action: &Array2<f32>) -> Result<Array1<f32>> {
        let greedy = self.sample_action_with_rng(scores, &mut rand::thread_rng())?.action;
        check_action_shape(action, greedy.nrows(), greedy.ncols())?;
        Ok(greedy
            .rows()
            .into_iter()
            .zip(action.rows())
            .map(|(g, a)| if g == a { 0.0 } else { f32::NEG_INFINITY })
            .collect())
    }
}

/// Draws from `softmax(scores / temperature)`.
///
/// The temperature only changes when [`Sampler::update`] is called and a
/// schedule was given.
pub struct SoftmaxActionSampler {
    temperature: f32,
    schedule: Option<Box<dyn Schedule>>,
    updates: usize,
}

impl fmt::Debug for SoftmaxActionSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftmaxActionSampler")
            .field("temperature", &self.temperature)
            .field("scheduled", &self.schedule.is_some())
            .field("updates", &self.updates)
            .finish()
    }
}

impl SoftmaxActionSampler {
    /// Fixed temperature; must be positive
    pub fn new(temperature: f32) -> Result<Self> {
        if temperature <= 0.0 || !temperature.is_finite() {
            return Err(RLError::Configuration(format!(
                "softmax temperature must be positive, got {temperature}"
            )));
        }
        Ok(Self {
            temperature,
            schedule: None,
            updates: 0,
        })
    }

    /// Temperature following `schedule`, advanced by [`Sampler::update`]
    pub fn with_schedule(schedule: Box<dyn Schedule>) -> Result<Self> {
        let mut sampler = Self::new(schedule.value(0))?;
        sampler.schedule = Some(schedule);
        Ok(sampler)
    }

    /// Current temperature
    #[must_use]
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    fn probabilities(&self, scores: &Scores) -> Result<Array2<f32>> {
        let Scores::Discrete(q) = scores else {
            return Err(unexpected("softmax sampler", scores));
        };
        let mut probs = Array2::zeros(q.raw_dim());
        for (row, mut out) in q.rows().into_iter().zip(probs.rows_mut()) {
            out.assign(&softmax(row, self.temperature));
        }
        Ok(probs)
    }
}

impl Sampler for SoftmaxActionSampler {
    fn sample_action_with_rng(
        &self,
        scores: &Scores,
        rng: &mut dyn RngCore,
    ) -> Result<ActorOutput> {
        let probs = self.probabilities(scores)?;
        let indices: Vec<usize> = probs
            .rows()
            .into_iter()
            .map(|row| sample_categorical(row, rng))
            .collect();
        let log_prob = indices
            .iter()
            .zip(probs.rows())
            .map(|(&i, row)| row[i].ln())
            .collect();
        Ok(ActorOutput {
            action: one_hot(&indices, probs.ncols()),
            log_prob,
        })
    }

    fn log_prob(&self, scores: &Scores, action: &Array2<f32>) -> Result<Array1<f32>> {
        let probs = self.probabilities(scores)?;
        check_action_shape(action, probs.nrows(), probs.ncols())?;
        Ok((&probs * action).sum_axis(Axis(1)).mapv(f32::ln))
    }

    fn update(&mut self) {
        if let Some(schedule) = &self.schedule {
            self.updates += 1;
            self.temperature = schedule.value(self.updates).max(f32::MIN_POSITIVE);
        }
    }
}

/// Samples `loc + exp(scale_log) · ε` with standard normal `ε`
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianSampler;

impl GaussianSampler {
    fn parts(scores: &Scores) -> Result<(&Array2<f32>, &Array2<f32>)> {
        match scores {
            Scores::Gaussian { loc, scale_log } => {
                if loc.dim() != scale_log.dim() {
                    return Err(RLError::DimensionMismatch {
                        expected: loc.ncols(),
                        actual: scale_log.ncols(),
                    });
                }
                Ok((loc, scale_log))
            }
            _ => Err(unexpected("gaussian sampler", scores)),
        }
    }
}

impl Sampler for GaussianSampler {
    fn sample_action_with_rng(
        &self,
        scores: &Scores,
        rng: &mut dyn RngCore,
    ) -> Result<ActorOutput> {
        let (loc, scale_log) = Self::parts(scores)?;
        let mut action = loc.clone();
        action.zip_mut_with(scale_log, |a, &log_std| {
            let eps: f32 = rng.sample(StandardNormal);
            *a += log_std.exp() * eps;
        });
        let log_prob = self.log_prob(scores, &action)?;
        Ok(ActorOutput { action, log_prob })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn log_prob(&self, scores: &Scores, action: &Array2<f32>) -> Result<Array1<f32>> {
        let (loc, scale_log) = Self::parts(scores)?;
        check_action_shape(action, loc.nrows(), loc.ncols())?;
        let mut out = Array1::zeros(action.nrows());
        for (i, total) in out.iter_mut().enumerate() {
            let mut sum = 0.0_f64;
            for j in 0..action.ncols() {
                let normal = Normal::new(
                    f64::from(loc[[i, j]]),
                    f64::from(scale_log[[i, j]].exp()),
                )
                .map_err(|e| RLError::Computation(format!("invalid gaussian scores: {e}")))?;
                sum += normal.ln_pdf(f64::from(action[[i, j]]));
            }
            *total = sum as f32;
        }
        Ok(out)
    }
}

/// Uniform one-hot actions, ignoring scores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscreteRandomSampler {
    num_actions: usize,
}

impl DiscreteRandomSampler {
    /// At least one action is required
    pub fn new(num_actions: usize) -> Result<Self> {
        if num_actions == 0 {
            return Err(RLError::Configuration(
                "discrete random sampler needs at least one action".to_string(),
            ));
        }
        Ok(Self { num_actions })
    }

    /// Number of actions
    #[must_use]
    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    #[allow(clippy::cast_precision_loss)]
    fn uniform_log_prob(&self) -> f32 {
        (1.0 / self.num_actions as f32).ln()
    }
}

impl Sampler for DiscreteRandomSampler {
    fn sample_action_with_rng(
        &self,
        scores: &Scores,
        rng: &mut dyn RngCore,
    ) -> Result<ActorOutput> {
        let batch_size = scores.batch_size();
        let indices: Vec<usize> = (0..batch_size)
            .map(|_| rng.gen_range(0..self.num_actions))
            .collect();
        Ok(ActorOutput {
            action: one_hot(&indices, self.num_actions),
            log_prob: Array1::from_elem(batch_size, self.uniform_log_prob()),
        })
    }

    fn log_prob(&self, scores: &Scores, action: &Array2<f32>) -> Result<Array1<f32>> {
        check_action_shape(action, scores.batch_size(), self.num_actions)?;
        Ok(Array1::from_elem(action.nrows(), self.uniform_log_prob()))
    }
}

/// Uniform actions inside per-dimension bounds, ignoring scores
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousRandomSampler {
    low: Vec<f32>,
    high: Vec<f32>,
}

impl ContinuousRandomSampler {
    /// `low` and `high` must have equal, non-zero length with `low < high`
    pub fn new(low: Vec<f32>, high: Vec<f32>) -> Result<Self> {
        if low.len() != high.len() {
            return Err(RLError::Configuration(format!(
                "low has {} dimensions but high has {}",
                low.len(),
                high.len()
            )));
        }
        if low.is_empty() {
            return Err(RLError::Configuration(
                "continuous random sampler needs at least one dimension".to_string(),
            ));
        }
        if let Some((l, h)) = low.iter().zip(&high).find(|(l, h)| l >= h) {
            return Err(RLError::Configuration(format!(
                "lower bound {l} is not below upper bound {h}"
            )));
        }
        Ok(Self { low, high })
    }

    /// Lower bounds
    #[must_use]
    pub fn low(&self) -> &[f32] {
        &self.low
    }

    /// Upper bounds
    #[must_use]
    pub fn high(&self) -> &[f32] {
        &self.high
    }

    fn log_volume(&self) -> f32 {
        self.low
            .iter()
            .zip(&self.high)
            .map(|(l, h)| (h - l).ln())
            .sum()
    }
}

impl Sampler for ContinuousRandomSampler {
    fn sample_action_with_rng(
        &self,
        scores: &Scores,
        rng: &mut dyn RngCore,
    ) -> Result<ActorOutput> {
        let batch_size = scores.batch_size();
        let dims = self.low.len();
        let action = Array2::from_shape_fn((batch_size, dims), |(_, j)| {
            rng.gen_range(self.low[j]..self.high[j])
        });
        Ok(ActorOutput {
            action,
            log_prob: Array1::from_elem(batch_size, -self.log_volume()),
        })
    }

    fn log_prob(&self, scores: &Scores, action: &Array2<f32>) -> Result<Array1<f32>> {
        check_action_shape(action, scores.batch_size(), self.low.len())?;
        let inside = -self.log_volume();
        Ok(action
            .rows()
            .into_iter()
            .map(|row| {
                let contained = row
                    .iter()
                    .zip(self.low.iter().zip(&self.high))
                    .all(|(a, (l, h))| a >= l && a <= h);
                if contained {
                    inside
                } else {
                    f32::NEG_INFINITY
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rlkit_training::utils::LinearSchedule;

    #[test]
    fn greedy_is_deterministic() {
        let scores = Scores::Discrete(arr2(&[[0.1, 0.9, 0.3], [2.0, -1.0, 1.5]]));
        let first = GreedyActionSampler.sample_action(&scores).unwrap();
        for _ in 0..10 {
            assert_eq!(GreedyActionSampler.sample_action(&scores).unwrap(), first);
        }
        assert_eq!(first.action, arr2(&[[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]]));
        assert!(first.log_prob.iter().all(|&lp| lp == 0.0));
    }

    #[test]
    fn greedy_log_prob_rejects_other_actions() {
        let scores = Scores::Discrete(arr2(&[[0.1, 0.9]]));
        let lp = GreedyActionSampler
            .log_prob(&scores, &arr2(&[[1.0, 0.0]]))
            .unwrap();
        assert_eq!(lp[0], f32::NEG_INFINITY);
    }

    #[test]
    fn softmax_converges_to_greedy_as_temperature_vanishes() {
        let scores = Scores::Discrete(arr2(&[[0.1, 0.5, 0.45], [1.0, 0.2, 0.0]]));
        let greedy = GreedyActionSampler.sample_action(&scores).unwrap().action;
        let mut rng = StdRng::seed_from_u64(7);
        let mut previous_mismatch = usize::MAX;
        for temperature in [1.0, 0.1, 0.01, 0.001] {
            let sampler = SoftmaxActionSampler::new(temperature).unwrap();
            let mismatches = (0..200)
                .filter(|_| {
                    sampler
                        .sample_action_with_rng(&scores, &mut rng)
                        .unwrap()
                        .action
                        != greedy
                })
                .count();
            assert!(mismatches <= previous_mismatch.saturating_add(10));
            previous_mismatch = mismatches;
        }
        assert_eq!(previous_mismatch, 0);
    }

    #[test]
    fn softmax_log_prob_matches_sample() {
        let scores = Scores::Discrete(arr2(&[[0.0, 1.0]]));
        let sampler = SoftmaxActionSampler::new(1.0).unwrap();
        let out = sampler.sample_action(&scores).unwrap();
        let lp = sampler.log_prob(&scores, &out.action).unwrap();
        assert_relative_eq!(lp[0], out.log_prob[0], epsilon = 1e-6);
    }

    #[test]
    fn softmax_temperature_changes_only_on_update() {
        let schedule = LinearSchedule::new(1.0, 0.1, 10);
        let mut sampler = SoftmaxActionSampler::with_schedule(Box::new(schedule)).unwrap();
        let scores = Scores::Discrete(arr2(&[[0.0, 1.0]]));
        for _ in 0..5 {
            sampler.sample_action(&scores).unwrap();
        }
        assert_relative_eq!(sampler.temperature(), 1.0);
        sampler.update();
        assert!(sampler.temperature() < 1.0);
    }

    #[test]
    fn softmax_rejects_gaussian_scores() {
        let scores = Scores::Gaussian {
            loc: arr2(&[[0.0]]),
            scale_log: arr2(&[[0.0]]),
        };
        let sampler = SoftmaxActionSampler::new(1.0).unwrap();
        assert!(matches!(
            sampler.sample_action(&scores),
            Err(RLError::Policy(_))
        ));
    }

    #[test]
    fn gaussian_log_prob_is_analytic() {
        let scores = Scores::Gaussian {
            loc: arr2(&[[0.0, 1.0]]),
            scale_log: arr2(&[[0.0, 0.0]]),
        };
        let lp = GaussianSampler
            .log_prob(&scores, &arr2(&[[0.0, 1.0]]))
            .unwrap();
        let expected = -(2.0 * std::f32::consts::PI).ln();
        assert_relative_eq!(lp[0], expected, epsilon = 1e-5);

        let out = GaussianSampler.sample_action(&scores).unwrap();
        assert_eq!(out.action.dim(), (1, 2));
    }

    #[test]
    fn continuous_random_rejects_mismatched_bounds() {
        assert!(matches!(
            ContinuousRandomSampler::new(vec![-1.0], vec![1.0, 2.0]),
            Err(RLError::Configuration(_))
        ));
        assert!(ContinuousRandomSampler::new(vec![1.0], vec![-1.0]).is_err());
    }

    proptest! {
        #[test]
        fn discrete_random_rows_are_one_hot(n in 1usize..12, batch in 1usize..32, seed in any::<u64>()) {
            let sampler = DiscreteRandomSampler::new(n).unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            let out = sampler
                .sample_action_with_rng(&Scores::Unscored { batch_size: batch }, &mut rng)
                .unwrap();
            prop_assert_eq!(out.action.dim(), (batch, n));
            for row in out.action.rows() {
                prop_assert_eq!(row.iter().filter(|&&v| v == 1.0).count(), 1);
                prop_assert_eq!(row.iter().filter(|&&v| v == 0.0).count(), n - 1);
            }
            let expected = (1.0 / n as f32).ln();
            prop_assert!(out.log_prob.iter().all(|&lp| (lp - expected).abs() < 1e-6));
        }

        #[test]
        fn continuous_random_stays_in_bounds(
            low in -10.0f32..0.0,
            width in 0.01f32..10.0,
            batch in 1usize..32,
            seed in any::<u64>(),
        ) {
            let high = low + width;
            let sampler = ContinuousRandomSampler::new(vec![low], vec![high]).unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            let out = sampler
                .sample_action_with_rng(&Scores::Unscored { batch_size: batch }, &mut rng)
                .unwrap();
            prop_assert_eq!(out.action.dim(), (batch, 1));
            prop_assert!(out.action.iter().all(|&a| a >= low && a <= high));
        }
    }
}
