//! Action spaces and continuous action ranges

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{RLError, Result};

/// Description of an environment's action space.
///
/// The set of kinds is closed: components that only handle some of them
/// resolve the kind once with a `match` and fail with
/// [`RLError::UnsupportedActionSpace`] otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionSpace {
    /// `n` mutually exclusive actions
    Discrete {
        /// Number of discrete actions
        n: usize,
    },
    /// Continuous box with per-dimension bounds
    ContinuousBox {
        /// Lower bounds for each dimension
        low: Vec<f32>,
        /// Upper bounds for each dimension
        high: Vec<f32>,
        /// Shape of a single action
        shape: Vec<usize>,
    },
    /// Several independent discrete sub-actions
    MultiDiscrete {
        /// Number of choices for each sub-action
        nvec: Vec<usize>,
    },
}

impl ActionSpace {
    /// Create a discrete action space
    #[must_use]
    pub fn discrete(n: usize) -> Self {
        Self::Discrete { n }
    }

    /// Create a flat continuous box; `low` and `high` must have equal length
    pub fn continuous(low: Vec<f32>, high: Vec<f32>) -> Result<Self> {
        if low.len() != high.len() {
            return Err(RLError::DimensionMismatch {
                expected: low.len(),
                actual: high.len(),
            });
        }
        if let Some((l, h)) = low.iter().zip(&high).find(|(l, h)| l > h) {
            return Err(RLError::Configuration(format!(
                "box lower bound {l} exceeds upper bound {h}"
            )));
        }
        let shape = vec![low.len()];
        Ok(Self::ContinuousBox { low, high, shape })
    }

    /// Short name of the space kind, used in error messages
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discrete { .. } => "Discrete",
            Self::ContinuousBox { .. } => "Box",
            Self::MultiDiscrete { .. } => "MultiDiscrete",
        }
    }

    /// Width of the action tensor a policy emits for this space
    #[must_use]
    pub fn action_dim(&self) -> usize {
        match self {
            Self::Discrete { n } => *n,
            Self::ContinuousBox { low, .. } => low.len(),
            Self::MultiDiscrete { nvec } => nvec.iter().sum(),
        }
    }

    /// Sample a random action in the policy encoding (one-hot for discrete)
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f32> {
        match self {
            Self::Discrete { n } => {
                let mut action = vec![0.0; *n];
                if *n > 0 {
                    action[rng.gen_range(0..*n)] = 1.0;
                }
                action
            }
            Self::ContinuousBox { low, high, .. } => low
                .iter()
                .zip(high)
                .map(|(l, h)| if l < h { rng.gen_range(*l..*h) } else { *l })
                .collect(),
            Self::MultiDiscrete { nvec } => nvec
                .iter()
                .flat_map(|&n| {
                    let mut part = vec![0.0; n];
                    if n > 0 {
                        part[rng.gen_range(0..n)] = 1.0;
                    }
                    part
                })
                .collect(),
        }
    }

    /// Check if an encoded action is valid within this space
    #[must_use]
    pub fn contains(&self, action: &[f32]) -> bool {
        match self {
            Self::Discrete { n } => {
                action.len() == *n
                    && action.iter().all(|&x| x == 0.0 || x == 1.0)
                    && action.iter().filter(|&&x| x == 1.0).count() == 1
            }
            Self::ContinuousBox { low, high, .. } => {
                action.len() == low.len()
                    && action
                        .iter()
                        .zip(low)
                        .zip(high)
                        .all(|((x, l), h)| x >= l && x <= h)
            }
            Self::MultiDiscrete { nvec } => action.len() == nvec.iter().sum::<usize>(),
        }
    }
}

/// Range continuous actions are scaled into for training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContinuousActionRange {
    /// Lower end of the training range
    pub low: f32,
    /// Upper end of the training range
    pub high: f32,
}

impl ContinuousActionRange {
    /// Create a new range, rejecting empty or inverted ranges
    pub fn new(low: f32, high: f32) -> Result<Self> {
        if low >= high || !low.is_finite() || !high.is_finite() {
            return Err(RLError::Configuration(format!(
                "invalid continuous action range ({low}, {high})"
            )));
        }
        Ok(Self { low, high })
    }

    /// Width of the range
    #[must_use]
    pub fn width(&self) -> f32 {
        self.high - self.low
    }
}

impl Default for ContinuousActionRange {
    fn default() -> Self {
        const EPS: f32 = 1e-6;
        Self {
            low: -1.0 + EPS,
            high: 1.0 - EPS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuous_rejects_mismatched_bounds() {
        let err = ActionSpace::continuous(vec![0.0, 0.0], vec![1.0]).unwrap_err();
        assert!(matches!(err, RLError::DimensionMismatch { expected: 2, actual: 1 }));
    }

    #[test]
    fn discrete_samples_are_one_hot() {
        let space = ActionSpace::discrete(5);
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let action = space.sample(&mut rng);
            assert!(space.contains(&action));
        }
    }

    #[test]
    fn box_samples_stay_in_bounds() {
        let space = ActionSpace::continuous(vec![-2.0, 0.0], vec![2.0, 0.5]).unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            assert!(space.contains(&space.sample(&mut rng)));
        }
        assert_eq!(space.action_dim(), 2);
    }

    #[test]
    fn default_training_range_is_open_unit_interval() {
        let range = ContinuousActionRange::default();
        assert!(range.low > -1.0 && range.high < 1.0);
        assert!(ContinuousActionRange::new(1.0, -1.0).is_err());
    }
}
