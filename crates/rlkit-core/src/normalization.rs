//! Per-feature normalization statistics

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::FeatureId;

/// How a raw feature is scaled into network input space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureType {
    /// Values in {0, 1}
    Binary,
    /// Values in [0, 1], mapped through a logit
    Probability,
    /// Real values, z-scored and clipped
    Continuous,
    /// Continuous action values, rescaled into the training action range
    ContinuousAction,
    /// Small set of integer codes, one-hot encoded
    Enum,
    /// Passed through untouched
    DoNotPreprocess,
}

/// Statistics needed to normalize one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationParameters {
    /// Feature type
    pub feature_type: FeatureType,
    /// Mean of the observed values
    pub mean: f32,
    /// Standard deviation of the observed values
    pub stddev: f32,
    /// Smallest observed value
    pub min_value: Option<f32>,
    /// Largest observed value
    pub max_value: Option<f32>,
    /// Possible values of an enum feature, sorted
    pub possible_values: Option<Vec<f32>>,
}

impl NormalizationParameters {
    /// Parameters for a z-scored continuous feature
    #[must_use]
    pub fn continuous(mean: f32, stddev: f32, min_value: f32, max_value: f32) -> Self {
        Self {
            feature_type: FeatureType::Continuous,
            mean,
            stddev,
            min_value: Some(min_value),
            max_value: Some(max_value),
            possible_values: None,
        }
    }

    /// Parameters for a continuous action dimension bounded by `[min, max]`
    #[must_use]
    pub fn continuous_action(min_value: f32, max_value: f32) -> Self {
        Self {
            feature_type: FeatureType::ContinuousAction,
            mean: 0.0,
            stddev: 1.0,
            min_value: Some(min_value),
            max_value: Some(max_value),
            possible_values: None,
        }
    }

    /// Parameters for features of a simple type that carry no statistics
    #[must_use]
    pub fn of_type(feature_type: FeatureType) -> Self {
        Self {
            feature_type,
            mean: 0.0,
            stddev: 1.0,
            min_value: None,
            max_value: None,
            possible_values: None,
        }
    }

    /// Parameters for an enum feature
    #[must_use]
    pub fn enumeration(mut possible_values: Vec<f32>) -> Self {
        possible_values.sort_by(f32::total_cmp);
        possible_values.dedup();
        Self {
            possible_values: Some(possible_values),
            ..Self::of_type(FeatureType::Enum)
        }
    }

    /// Number of network input columns this feature expands into
    #[must_use]
    pub fn output_dim(&self) -> usize {
        match self.feature_type {
            FeatureType::Enum => self.possible_values.as_ref().map_or(0, Vec::len),
            _ => 1,
        }
    }
}

/// Normalization parameters of one group of dense features
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationData {
    /// Parameters keyed by feature id, iterated in id order
    pub dense_normalization_parameters: BTreeMap<FeatureId, NormalizationParameters>,
}

impl NormalizationData {
    /// Wrap a parameter map
    #[must_use]
    pub fn new(dense_normalization_parameters: BTreeMap<FeatureId, NormalizationParameters>) -> Self {
        Self {
            dense_normalization_parameters,
        }
    }

    /// Feature ids in the dense column order
    #[must_use]
    pub fn feature_ids(&self) -> Vec<FeatureId> {
        self.dense_normalization_parameters.keys().copied().collect()
    }

    /// Number of raw dense features
    #[must_use]
    pub fn num_features(&self) -> usize {
        self.dense_normalization_parameters.len()
    }

    /// Width of the normalized tensor
    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.dense_normalization_parameters
            .values()
            .map(NormalizationParameters::output_dim)
            .sum()
    }
}

/// Which feature group a [`NormalizationData`] describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationKey {
    /// State features
    State,
    /// Continuous action features
    Action,
}

impl fmt::Display for NormalizationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State => write!(f, "state"),
            Self::Action => write!(f, "action"),
        }
    }
}

/// Normalization data of every feature group a model consumes
pub type NormalizationDataMap = BTreeMap<NormalizationKey, NormalizationData>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_features_expand_to_one_column_per_value() {
        let mut params = BTreeMap::new();
        params.insert(1, NormalizationParameters::continuous(0.0, 1.0, -1.0, 1.0));
        params.insert(2, NormalizationParameters::enumeration(vec![3.0, 1.0, 2.0, 1.0]));
        let data = NormalizationData::new(params);

        assert_eq!(data.num_features(), 2);
        assert_eq!(data.output_dim(), 4);
        assert_eq!(
            data.dense_normalization_parameters[&2].possible_values,
            Some(vec![1.0, 2.0, 3.0])
        );
    }

    #[test]
    fn feature_type_uses_screaming_case() {
        let json = serde_json::to_string(&FeatureType::DoNotPreprocess).unwrap();
        assert_eq!(json, "\"DO_NOT_PREPROCESS\"");
    }
}
