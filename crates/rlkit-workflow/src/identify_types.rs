//! Inferring feature types and normalization statistics from samples

use std::collections::BTreeMap;

use tracing::{info, warn};

use rlkit_core::{FeatureId, FeatureType, NormalizationParameters, Result};

use crate::data_fetcher::{DataFetcher, FeatureColumn};
use crate::types::{PreprocessingOptions, TableSpec};

/// Identify normalization parameters of every feature in `column`.
///
/// Features outside the whitelist (when one is given) are skipped, as are
/// features without a single finite sample. The result only depends on the
/// sampled values, so repeated calls on the same table agree.
pub fn identify_normalization_parameters(
    fetcher: &dyn DataFetcher,
    table: &TableSpec,
    column: FeatureColumn,
    options: &PreprocessingOptions,
) -> Result<BTreeMap<FeatureId, NormalizationParameters>> {
    let samples = fetcher.sample_feature_values(table, column, options.num_samples)?;
    let mut parameters = BTreeMap::new();

    if let Some(whitelist) = &options.whitelist_features {
        for id in whitelist.iter().filter(|id| !samples.contains_key(*id)) {
            warn!(feature_id = id, ?column, "whitelisted feature has no samples");
        }
    }

    for (id, values) in &samples {
        if let Some(whitelist) = &options.whitelist_features {
            if !whitelist.contains(id) {
                continue;
            }
        }
        let values: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            warn!(feature_id = id, ?column, "feature has no finite samples, skipping");
            continue;
        }
        let forced = options.feature_overrides.get(id).copied();
        parameters.insert(*id, identify_parameter(&values, forced, options));
    }

    info!(
        table = %table.table_name,
        ?column,
        features = parameters.len(),
        "identified normalization parameters"
    );
    Ok(parameters)
}

#[allow(clippy::float_cmp)]
fn infer_type(values: &[f32], max_unique_enum_values: usize) -> FeatureType {
    if values.iter().all(|&v| v == 0.0 || v == 1.0) {
        return FeatureType::Binary;
    }
    if values.iter().all(|&v| (0.0..=1.0).contains(&v)) {
        return FeatureType::Probability;
    }
    if values.iter().all(|v| v.fract() == 0.0) && unique(values).len() <= max_unique_enum_values {
        return FeatureType::Enum;
    }
    FeatureType::Continuous
}

fn unique(values: &[f32]) -> Vec<f32> {
    let mut unique = values.to_vec();
    unique.sort_by(f32::total_cmp);
    unique.dedup();
    unique
}

fn min_max(values: &[f32]) -> (f32, f32) {
    values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

#[allow(clippy::cast_precision_loss)]
fn mean_stddev(values: &[f32]) -> (f32, f32) {
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (mean, variance.sqrt())
}

/// Normalization parameters of one feature from its (finite, non-empty)
/// sampled values, using `forced` instead of inference when given
#[must_use]
pub fn identify_parameter(
    values: &[f32],
    forced: Option<FeatureType>,
    options: &PreprocessingOptions,
) -> NormalizationParameters {
    let feature_type =
        forced.unwrap_or_else(|| infer_type(values, options.max_unique_enum_values));
    let (min_value, max_value) = min_max(values);
    match feature_type {
        FeatureType::Enum => NormalizationParameters::enumeration(unique(values)),
        FeatureType::ContinuousAction => {
            NormalizationParameters::continuous_action(min_value, max_value)
        }
        FeatureType::Continuous => {
            let (mean, stddev) = mean_stddev(values);
            let stddev = if stddev < options.min_stddev { 1.0 } else { stddev };
            NormalizationParameters::continuous(mean, stddev, min_value, max_value)
        }
        other => NormalizationParameters::of_type(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_fetcher::InMemoryDataFetcher;
    use approx::assert_relative_eq;
    use rlkit_core::{RawAction, RawFeatures, TransitionRow};

    fn fetcher() -> InMemoryDataFetcher {
        let rows = (0..20)
            .map(|i| {
                let x = i as f32;
                TransitionRow {
                    mdp_id: format!("mdp{}", i / 5),
                    sequence_number: i64::from(i % 5),
                    state_features: RawFeatures::from([
                        (1, (i % 2) as f32),
                        (2, x / 20.0),
                        (3, (i % 3) as f32),
                        (4, x * 1.5 - 7.0),
                        (5, 4.0),
                    ]),
                    action: RawAction::Discrete("L".to_string()),
                    action_probability: 1.0,
                    reward: 0.0,
                    next_state_features: RawFeatures::new(),
                    next_action: RawAction::none(),
                    possible_next_actions: Vec::new(),
                    terminal: false,
                    metrics: Default::default(),
                    step: 1,
                }
            })
            .collect();
        let mut fetcher = InMemoryDataFetcher::new();
        fetcher.insert_table("t", rows);
        fetcher
    }

    fn identify(options: &PreprocessingOptions) -> BTreeMap<FeatureId, NormalizationParameters> {
        identify_normalization_parameters(
            &fetcher(),
            &TableSpec::new("t"),
            FeatureColumn::StateFeatures,
            options,
        )
        .unwrap()
    }

    #[test]
    fn types_are_inferred_in_order() {
        let params = identify(&PreprocessingOptions::default());
        assert_eq!(params[&1].feature_type, FeatureType::Binary);
        assert_eq!(params[&2].feature_type, FeatureType::Probability);
        assert_eq!(params[&3].feature_type, FeatureType::Enum);
        assert_eq!(params[&3].possible_values, Some(vec![0.0, 1.0, 2.0]));
        assert_eq!(params[&4].feature_type, FeatureType::Continuous);
    }

    #[test]
    fn constant_continuous_feature_gets_unit_stddev() {
        let options = PreprocessingOptions {
            feature_overrides: BTreeMap::from([(5, FeatureType::Continuous)]),
            ..PreprocessingOptions::default()
        };
        let params = identify(&options);
        assert_relative_eq!(params[&5].mean, 4.0);
        assert_relative_eq!(params[&5].stddev, 1.0);
    }

    #[test]
    fn whitelist_and_overrides_apply() {
        let options = PreprocessingOptions {
            whitelist_features: Some(vec![3, 4, 99]),
            feature_overrides: BTreeMap::from([(3, FeatureType::Continuous)]),
            ..PreprocessingOptions::default()
        };
        let params = identify(&options);
        assert_eq!(params.keys().copied().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(params[&3].feature_type, FeatureType::Continuous);
    }

    #[test]
    fn identification_is_idempotent() {
        let options = PreprocessingOptions::default();
        assert_eq!(identify(&options), identify(&options));
    }

    #[test]
    fn continuous_statistics() {
        let options = PreprocessingOptions {
            max_unique_enum_values: 2,
            ..PreprocessingOptions::default()
        };
        let params = identify_parameter(&[1.0, 3.0, 5.0, 7.0], None, &options);
        assert_eq!(params.feature_type, FeatureType::Continuous);
        assert_relative_eq!(params.mean, 4.0);
        assert_relative_eq!(params.stddev, 5.0_f32.sqrt());
        assert_eq!(params.min_value, Some(1.0));
        assert_eq!(params.max_value, Some(7.0));
    }
}
