//! Dataset queries over training tables

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{debug, info};

use rlkit_core::{FeatureId, RLError, RawAction, Result, TransitionRow};

use crate::types::{Dataset, TableSpec};

/// Feature column of a training table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureColumn {
    /// `state_features`
    StateFeatures,
    /// Continuous `action` features
    ActionFeatures,
}

/// Arguments of [`DataFetcher::query_data`]
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDataParams {
    /// Source table
    pub table: TableSpec,
    /// Actions are named discrete choices rather than feature maps
    pub discrete_action: bool,
    /// Allowed action names when `discrete_action` is set
    pub actions: Vec<String>,
    /// Keep the `possible_next_actions` column
    pub include_possible_actions: bool,
    /// Keep only episodes whose id hashes into this percentile range
    pub sample_range: Option<(f32, f32)>,
    /// Logged metric to use as the reward
    pub custom_reward_expression: Option<String>,
    /// Aggregate this many consecutive steps into one row
    pub multi_steps: Option<u32>,
    /// Discount for multi-step aggregation
    pub gamma: f32,
}

/// Source of training data and feature samples
pub trait DataFetcher: Send + Sync {
    /// Up to `num_samples` values of every feature found in `column`.
    ///
    /// Must be deterministic for a given table so that feature
    /// identification is repeatable.
    fn sample_feature_values(
        &self,
        table: &TableSpec,
        column: FeatureColumn,
        num_samples: usize,
    ) -> Result<BTreeMap<FeatureId, Vec<f32>>>;

    /// Run a training-data query
    fn query_data(&self, params: &QueryDataParams) -> Result<Dataset>;
}

/// Tables of [`TransitionRow`]s kept in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataFetcher {
    tables: HashMap<String, Vec<TransitionRow>>,
}

impl InMemoryDataFetcher {
    /// Fetcher without tables
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a table
    pub fn insert_table(&mut self, name: impl Into<String>, rows: Vec<TransitionRow>) {
        self.tables.insert(name.into(), rows);
    }

    /// Load a table from a file holding one JSON row per line
    pub fn load_json_lines(&mut self, name: impl Into<String>, path: impl AsRef<Path>) -> Result<usize> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut rows = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str::<TransitionRow>(&line)?);
        }
        let name = name.into();
        info!(table = %name, rows = rows.len(), "loaded table");
        let count = rows.len();
        self.tables.insert(name, rows);
        Ok(count)
    }

    /// Rows of a table
    pub fn table(&self, table: &TableSpec) -> Result<&[TransitionRow]> {
        self.tables
            .get(&table.table_name)
            .map(Vec::as_slice)
            .ok_or_else(|| RLError::Configuration(format!("unknown table {:?}", table.table_name)))
    }
}

fn sorted_rows(rows: &[TransitionRow]) -> Vec<TransitionRow> {
    let mut rows = rows.to_vec();
    rows.sort_by(|a, b| {
        a.mdp_id
            .cmp(&b.mdp_id)
            .then(a.sequence_number.cmp(&b.sequence_number))
    });
    rows
}

/// 64-bit FNV-1a, stable across runs and platforms
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Percentile bucket of an episode, in `[0, 100)`
#[allow(clippy::cast_precision_loss)]
fn mdp_percentile(mdp_id: &str) -> f32 {
    (fnv1a(mdp_id.as_bytes()) % 10_000) as f32 / 100.0
}

fn check_sample_range((low, high): (f32, f32)) -> Result<()> {
    if (0.0..=100.0).contains(&low) && (0.0..=100.0).contains(&high) && low <= high {
        Ok(())
    } else {
        Err(RLError::Configuration(format!(
            "sample range ({low}, {high}) must satisfy 0 <= low <= high <= 100"
        )))
    }
}

fn check_actions(rows: &[TransitionRow], params: &QueryDataParams) -> Result<()> {
    if !params.discrete_action {
        return rows.iter().try_for_each(|row| match &row.action {
            RawAction::Continuous(_) => Ok(()),
            RawAction::Discrete(name) => Err(RLError::InvalidAction(format!(
                "discrete action {name:?} in continuous-action table"
            ))),
        });
    }
    let allowed: HashSet<&str> = params.actions.iter().map(String::as_str).collect();
    let known = |action: &RawAction, allow_none: bool| match action {
        RawAction::Discrete(name) if name.is_empty() && allow_none => Ok(()),
        RawAction::Discrete(name) if allowed.contains(name.as_str()) => Ok(()),
        RawAction::Discrete(name) => Err(RLError::InvalidAction(format!(
            "action {name:?} is not one of {:?}",
            params.actions
        ))),
        RawAction::Continuous(_) => Err(RLError::InvalidAction(
            "continuous action in discrete-action table".to_string(),
        )),
    };
    for row in rows {
        known(&row.action, false)?;
        known(&row.next_action, true)?;
    }
    Ok(())
}

fn apply_custom_reward(rows: &mut [TransitionRow], metric: &str) -> Result<()> {
    for row in rows {
        row.reward = *row.metrics.get(metric).ok_or_else(|| {
            RLError::Configuration(format!(
                "row {}:{} has no metric {metric:?} for the custom reward",
                row.mdp_id, row.sequence_number
            ))
        })?;
    }
    Ok(())
}

/// Fold up to `steps` consecutive rows of the same episode into one.
///
/// The reward becomes the discounted sum of the folded rewards; next state,
/// next action, possible actions and terminal come from the last folded row,
/// and `step` counts the folded environment steps.
#[allow(clippy::cast_precision_loss)]
fn aggregate_multi_steps(rows: &[TransitionRow], steps: usize, gamma: f32) -> Vec<TransitionRow> {
    let mut out = Vec::with_capacity(rows.len());
    let mut start = 0;
    while start < rows.len() {
        let mut end = start + 1;
        while end < rows.len() && rows[end].mdp_id == rows[start].mdp_id {
            end += 1;
        }
        let episode = &rows[start..end];
        for i in 0..episode.len() {
            let window = &episode[i..(i + steps).min(episode.len())];
            let mut row = episode[i].clone();
            let mut discount = 1.0;
            row.reward = 0.0;
            row.step = 0;
            for folded in window {
                row.reward += discount * folded.reward;
                row.step += folded.step;
                discount *= gamma.powf(folded.step as f32);
            }
            if let Some(last) = window.last() {
                row.next_state_features = last.next_state_features.clone();
                row.next_action = last.next_action.clone();
                row.possible_next_actions = last.possible_next_actions.clone();
                row.terminal = last.terminal;
            }
            out.push(row);
        }
        start = end;
    }
    out
}

impl DataFetcher for InMemoryDataFetcher {
    fn sample_feature_values(
        &self,
        table: &TableSpec,
        column: FeatureColumn,
        num_samples: usize,
    ) -> Result<BTreeMap<FeatureId, Vec<f32>>> {
        let mut values: BTreeMap<FeatureId, Vec<f32>> = BTreeMap::new();
        for row in sorted_rows(self.table(table)?).iter().take(num_samples) {
            let features = match (column, &row.action) {
                (FeatureColumn::StateFeatures, _) => &row.state_features,
                (FeatureColumn::ActionFeatures, RawAction::Continuous(features)) => features,
                (FeatureColumn::ActionFeatures, RawAction::Discrete(_)) => continue,
            };
            for (&id, &value) in features {
                values.entry(id).or_default().push(value);
            }
        }
        Ok(values)
    }

    fn query_data(&self, params: &QueryDataParams) -> Result<Dataset> {
        let mut rows = sorted_rows(self.table(&params.table)?);
        if let Some(range) = params.sample_range {
            check_sample_range(range)?;
            rows.retain(|row| {
                let p = mdp_percentile(&row.mdp_id);
                p >= range.0 && p < range.1
            });
        }
        check_actions(&rows, params)?;
        if !params.include_possible_actions {
            for row in &mut rows {
                row.possible_next_actions.clear();
            }
        }
        if let Some(metric) = &params.custom_reward_expression {
            apply_custom_reward(&mut rows, metric)?;
        }
        if let Some(steps) = params.multi_steps {
            if steps == 0 {
                return Err(RLError::Configuration("multi_steps must be positive".to_string()));
            }
            rows = aggregate_multi_steps(&rows, steps as usize, params.gamma);
        }
        debug!(table = %params.table.table_name, rows = rows.len(), "queried data");
        Ok(Dataset::new(rows))
    }
}
