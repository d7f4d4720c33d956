//! Turning replayed environment transitions into trainer batches
//!
//! Transitions are first encoded as [`TransitionRow`]s so online and offline
//! data flow through the same batch preprocessors and normalization.

use std::collections::HashSet;

use rlkit_core::{FeatureId, RLError, RawAction, RawFeatures, Result, Transition, TransitionRow};
use rlkit_training::preprocessing::{argmax, BatchPreprocessor};

/// Column layout of actions in the encoded rows
#[derive(Debug, Clone, PartialEq)]
pub enum ActionColumns {
    /// One-hot actions named by position
    Discrete(Vec<String>),
    /// Continuous action values keyed by feature id
    Continuous(Vec<FeatureId>),
}

impl ActionColumns {
    fn width(&self) -> usize {
        match self {
            Self::Discrete(names) => names.len(),
            Self::Continuous(ids) => ids.len(),
        }
    }
}

/// Encodes [`Transition`]s as dataset rows
#[derive(Debug, Clone)]
pub struct TransitionEncoder {
    state_feature_ids: Vec<FeatureId>,
    actions: ActionColumns,
}

fn check_unique<T: std::hash::Hash + Eq + std::fmt::Debug>(items: &[T], what: &str) -> Result<()> {
    if items.is_empty() {
        return Err(RLError::Configuration(format!("no {what} configured")));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = items.iter().find(|item| !seen.insert(*item)) {
        return Err(RLError::Configuration(format!("duplicate {what} {dup:?}")));
    }
    Ok(())
}

impl TransitionEncoder {
    /// Observation element `i` becomes feature `state_feature_ids[i]`
    pub fn new(state_feature_ids: Vec<FeatureId>, actions: ActionColumns) -> Result<Self> {
        check_unique(&state_feature_ids, "state feature ids")?;
        match &actions {
            ActionColumns::Discrete(names) => check_unique(names, "action names")?,
            ActionColumns::Continuous(ids) => check_unique(ids, "action feature ids")?,
        }
        Ok(Self {
            state_feature_ids,
            actions,
        })
    }

    /// Encoder whose state feature ids are `0..observation_dim`
    pub fn with_sequential_ids(observation_dim: usize, actions: ActionColumns) -> Result<Self> {
        let ids = (0..observation_dim)
            .map(|i| FeatureId::try_from(i).map_err(|e| RLError::Configuration(e.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Self::new(ids, actions)
    }

    /// State feature ids in observation order
    #[must_use]
    pub fn state_feature_ids(&self) -> &[FeatureId] {
        &self.state_feature_ids
    }

    /// Action column layout
    #[must_use]
    pub fn actions(&self) -> &ActionColumns {
        &self.actions
    }

    fn features(&self, observation: &[f32]) -> Result<RawFeatures> {
        if observation.len() != self.state_feature_ids.len() {
            return Err(RLError::DimensionMismatch {
                expected: self.state_feature_ids.len(),
                actual: observation.len(),
            });
        }
        Ok(self
            .state_feature_ids
            .iter()
            .copied()
            .zip(observation.iter().copied())
            .collect())
    }

    fn action(&self, transition: &Transition) -> Result<RawAction> {
        if transition.action.len() != self.actions.width() {
            return Err(RLError::DimensionMismatch {
                expected: self.actions.width(),
                actual: transition.action.len(),
            });
        }
        Ok(match &self.actions {
            ActionColumns::Discrete(names) => {
                RawAction::Discrete(names[argmax(transition.action.view())].clone())
            }
            ActionColumns::Continuous(ids) => RawAction::Continuous(
                ids.iter()
                    .copied()
                    .zip(transition.action.iter().copied())
                    .collect(),
            ),
        })
    }

    /// Encode one transition as the `sequence_number`-th row of a replay episode
    pub fn encode(&self, transition: &Transition, sequence_number: i64) -> Result<TransitionRow> {
        Ok(TransitionRow {
            mdp_id: "replay".to_string(),
            sequence_number,
            state_features: self.features(&transition.observation)?,
            action: self.action(transition)?,
            action_probability: transition.log_prob.exp(),
            reward: transition.reward,
            next_state_features: self.features(&transition.next_observation)?,
            next_action: RawAction::none(),
            possible_next_actions: Vec::new(),
            terminal: transition.terminal,
            metrics: Default::default(),
            step: 1,
        })
    }

    /// Encode a batch of transitions
    pub fn encode_batch(&self, transitions: &[Transition]) -> Result<Vec<TransitionRow>> {
        transitions
            .iter()
            .zip(0_i64..)
            .map(|(t, i)| self.encode(t, i))
            .collect()
    }
}

/// Replayed transitions to trainer batches through a [`BatchPreprocessor`]
#[derive(Debug, Clone)]
pub struct ReplayTrainerPreprocessor<P> {
    encoder: TransitionEncoder,
    batch_preprocessor: P,
}

impl<P: BatchPreprocessor> ReplayTrainerPreprocessor<P> {
    /// Combine `encoder` with `batch_preprocessor`
    pub fn new(encoder: TransitionEncoder, batch_preprocessor: P) -> Self {
        Self {
            encoder,
            batch_preprocessor,
        }
    }

    /// Row encoder
    pub fn encoder(&self) -> &TransitionEncoder {
        &self.encoder
    }

    /// Build one trainer batch
    pub fn preprocess(&self, transitions: &[Transition]) -> Result<P::Output> {
        let rows = self.encoder.encode_batch(transitions)?;
        self.batch_preprocessor.preprocess(&rows)
    }
}
