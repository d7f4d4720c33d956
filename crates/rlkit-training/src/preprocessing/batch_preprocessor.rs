//! Conversion of raw dataset rows into trainer batch layouts

use std::collections::HashMap;

use ndarray::{Array1, Array2};

use rlkit_core::{RLError, RawAction, Result, TransitionRow};

use crate::preprocessing::Preprocessor;
use crate::types::{DiscreteDqnInput, MemoryNetworkInput, PolicyNetworkInput};

/// Turns a slice of raw rows into the tensor layout a trainer expects
pub trait BatchPreprocessor: Send + Sync {
    /// Batch layout produced
    type Output;

    /// Convert one batch of rows
    fn preprocess(&self, rows: &[TransitionRow]) -> Result<Self::Output>;
}

/// Name-to-column lookup for discrete actions
#[derive(Debug, Clone)]
struct ActionIndex {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl ActionIndex {
    fn new(names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Err(RLError::Configuration("no discrete actions configured".to_string()));
        }
        let index: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        if index.len() != names.len() {
            return Err(RLError::Configuration(format!(
                "duplicate action names in {names:?}"
            )));
        }
        Ok(Self {
            names: names.to_vec(),
            index,
        })
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    fn lookup(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| RLError::InvalidAction(format!("unknown action {name:?}")))
    }

    /// One-hot rows; the empty name yields an all-zero row
    fn one_hot<'a, I>(&self, actions: I, allow_none: bool) -> Result<Array2<f32>>
    where
        I: ExactSizeIterator<Item = &'a RawAction>,
    {
        let mut out = Array2::zeros((actions.len(), self.len()));
        for (row, action) in actions.enumerate() {
            match action {
                RawAction::Discrete(name) if name.is_empty() && allow_none => {}
                RawAction::Discrete(name) => out[[row, self.lookup(name)?]] = 1.0,
                RawAction::Continuous(_) => {
                    return Err(RLError::InvalidAction(
                        "continuous action in a discrete-action dataset".to_string(),
                    ))
                }
            }
        }
        Ok(out)
    }
}

fn check_not_empty(rows: &[TransitionRow]) -> Result<()> {
    if rows.is_empty() {
        Err(RLError::Precondition("cannot preprocess an empty batch".to_string()))
    } else {
        Ok(())
    }
}

fn column<F: Fn(&TransitionRow) -> f32>(rows: &[TransitionRow], f: F) -> Array1<f32> {
    rows.iter().map(f).collect()
}

fn not_terminal(rows: &[TransitionRow]) -> Array1<f32> {
    column(rows, |r| if r.terminal { 0.0 } else { 1.0 })
}

fn continuous_actions<'a, I>(preprocessor: &Preprocessor, actions: I) -> Result<Array2<f32>>
where
    I: Iterator<Item = &'a RawAction>,
{
    let features = actions
        .map(|action| match action {
            RawAction::Continuous(features) => Ok(features),
            RawAction::Discrete(name) => Err(RLError::InvalidAction(format!(
                "discrete action {name:?} in a continuous-action dataset"
            ))),
        })
        .collect::<Result<Vec<_>>>()?;
    preprocessor.transform_sparse(features)
}

/// Builds [`DiscreteDqnInput`] batches
#[derive(Debug, Clone)]
pub struct DiscreteDqnBatchPreprocessor {
    actions: ActionIndex,
    state: Preprocessor,
}

impl DiscreteDqnBatchPreprocessor {
    /// Create for the given action names and state preprocessor
    pub fn new(actions: &[String], state: Preprocessor) -> Result<Self> {
        Ok(Self {
            actions: ActionIndex::new(actions)?,
            state,
        })
    }
}

impl BatchPreprocessor for DiscreteDqnBatchPreprocessor {
    type Output = DiscreteDqnInput;

    #[allow(clippy::cast_precision_loss)]
    fn preprocess(&self, rows: &[TransitionRow]) -> Result<DiscreteDqnInput> {
        check_not_empty(rows)?;
        let mut mask = Array2::zeros((rows.len(), self.actions.len()));
        for (i, row) in rows.iter().enumerate() {
            if row.possible_next_actions.is_empty() {
                mask.row_mut(i).fill(1.0);
            } else {
                for name in &row.possible_next_actions {
                    mask[[i, self.actions.lookup(name)?]] = 1.0;
                }
            }
        }

        Ok(DiscreteDqnInput {
            state: self.state.transform_sparse(rows.iter().map(|r| &r.state_features))?,
            action: self.actions.one_hot(rows.iter().map(|r| &r.action), false)?,
            next_state: self
                .state
                .transform_sparse(rows.iter().map(|r| &r.next_state_features))?,
            next_action: self.actions.one_hot(rows.iter().map(|r| &r.next_action), true)?,
            possible_next_actions_mask: mask,
            reward: column(rows, |r| r.reward),
            not_terminal: not_terminal(rows),
            step: column(rows, |r| r.step as f32),
            action_probability: column(rows, |r| r.action_probability),
        })
    }
}

/// Builds [`PolicyNetworkInput`] batches
#[derive(Debug, Clone)]
pub struct PolicyNetworkBatchPreprocessor {
    state: Preprocessor,
    action: Preprocessor,
}

impl PolicyNetworkBatchPreprocessor {
    /// Create from the state and action preprocessors
    #[must_use]
    pub fn new(state: Preprocessor, action: Preprocessor) -> Self {
        Self { state, action }
    }
}

impl BatchPreprocessor for PolicyNetworkBatchPreprocessor {
    type Output = PolicyNetworkInput;

    #[allow(clippy::cast_precision_loss)]
    fn preprocess(&self, rows: &[TransitionRow]) -> Result<PolicyNetworkInput> {
        check_not_empty(rows)?;
        Ok(PolicyNetworkInput {
            state: self.state.transform_sparse(rows.iter().map(|r| &r.state_features))?,
            action: continuous_actions(&self.action, rows.iter().map(|r| &r.action))?,
            next_state: self
                .state
                .transform_sparse(rows.iter().map(|r| &r.next_state_features))?,
            reward: column(rows, |r| r.reward),
            not_terminal: not_terminal(rows),
            step: column(rows, |r| r.step as f32),
            action_probability: column(rows, |r| r.action_probability),
        })
    }
}

/// How a world model sees actions
#[derive(Debug, Clone)]
pub enum ActionEncoding {
    /// One-hot over named actions
    Discrete(Vec<String>),
    /// Continuous actions through their preprocessor
    Continuous(Preprocessor),
}

/// Builds [`MemoryNetworkInput`] batches
#[derive(Debug, Clone)]
pub struct MemoryNetworkBatchPreprocessor {
    state: Preprocessor,
    action: MemoryAction,
}

#[derive(Debug, Clone)]
enum MemoryAction {
    Discrete(ActionIndex),
    Continuous(Preprocessor),
}

impl MemoryNetworkBatchPreprocessor {
    /// Create from the state preprocessor and action encoding
    pub fn new(state: Preprocessor, action: ActionEncoding) -> Result<Self> {
        let action = match action {
            ActionEncoding::Discrete(names) => MemoryAction::Discrete(ActionIndex::new(&names)?),
            ActionEncoding::Continuous(pre) => MemoryAction::Continuous(pre),
        };
        Ok(Self { state, action })
    }
}

impl BatchPreprocessor for MemoryNetworkBatchPreprocessor {
    type Output = MemoryNetworkInput;

    fn preprocess(&self, rows: &[TransitionRow]) -> Result<MemoryNetworkInput> {
        check_not_empty(rows)?;
        let action = match &self.action {
            MemoryAction::Discrete(index) => index.one_hot(rows.iter().map(|r| &r.action), false)?,
            MemoryAction::Continuous(pre) => continuous_actions(pre, rows.iter().map(|r| &r.action))?,
        };
        Ok(MemoryNetworkInput {
            state: self.state.transform_sparse(rows.iter().map(|r| &r.state_features))?,
            action,
            next_state: self
                .state
                .transform_sparse(rows.iter().map(|r| &r.next_state_features))?,
            reward: column(rows, |r| r.reward),
            not_terminal: not_terminal(rows),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessing::PreprocessorOptions;
    use rlkit_core::{NormalizationData, NormalizationParameters, RawFeatures};
    use std::collections::BTreeMap;

    fn state_preprocessor() -> Preprocessor {
        let mut params = BTreeMap::new();
        params.insert(1, NormalizationParameters::continuous(0.0, 1.0, -5.0, 5.0));
        params.insert(2, NormalizationParameters::continuous(0.0, 1.0, -5.0, 5.0));
        Preprocessor::new(&NormalizationData::new(params), PreprocessorOptions::default()).unwrap()
    }

    fn row(action: &str, next_action: &str, terminal: bool) -> TransitionRow {
        let features: RawFeatures = [(1, 0.5), (2, -0.5)].into_iter().collect();
        TransitionRow {
            mdp_id: "0".to_string(),
            sequence_number: 0,
            state_features: features.clone(),
            action: RawAction::Discrete(action.to_string()),
            action_probability: 0.5,
            reward: 1.0,
            next_state_features: features,
            next_action: RawAction::Discrete(next_action.to_string()),
            possible_next_actions: if terminal { vec![] } else { vec!["R".to_string()] },
            terminal,
            metrics: HashMap::new(),
            step: 1,
        }
    }

    fn actions() -> Vec<String> {
        vec!["L".to_string(), "R".to_string()]
    }

    #[test]
    fn discrete_batch_layout() {
        let pre = DiscreteDqnBatchPreprocessor::new(&actions(), state_preprocessor()).unwrap();
        let batch = pre
            .preprocess(&[row("L", "R", false), row("R", "", true)])
            .unwrap();
        assert_eq!(batch.action.row(0).to_vec(), vec![1.0, 0.0]);
        assert_eq!(batch.next_action.row(1).to_vec(), vec![0.0, 0.0]);
        assert_eq!(batch.possible_next_actions_mask.row(0).to_vec(), vec![0.0, 1.0]);
        assert_eq!(batch.possible_next_actions_mask.row(1).to_vec(), vec![1.0, 1.0]);
        assert_eq!(batch.not_terminal.to_vec(), vec![1.0, 0.0]);
        assert_eq!(batch.state.dim(), (2, 2));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let pre = DiscreteDqnBatchPreprocessor::new(&actions(), state_preprocessor()).unwrap();
        let err = pre.preprocess(&[row("UP", "", true)]).unwrap_err();
        assert!(matches!(err, RLError::InvalidAction(_)));
    }

    #[test]
    fn empty_batch_is_a_precondition_failure() {
        let pre = MemoryNetworkBatchPreprocessor::new(
            state_preprocessor(),
            ActionEncoding::Discrete(actions()),
        )
        .unwrap();
        assert!(matches!(pre.preprocess(&[]), Err(RLError::Precondition(_))));
    }

    #[test]
    fn policy_batch_rejects_discrete_actions() {
        let mut params = BTreeMap::new();
        params.insert(100, NormalizationParameters::continuous_action(-1.0, 1.0));
        let action =
            Preprocessor::new(&NormalizationData::new(params), PreprocessorOptions::default()).unwrap();
        let pre = PolicyNetworkBatchPreprocessor::new(state_preprocessor(), action);
        assert!(pre.preprocess(&[row("L", "", true)]).is_err());
    }
}
