//! Normalization of raw features into network input space

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use rlkit_core::{
    ContinuousActionRange, FeatureId, FeatureType, NormalizationData, NormalizationParameters,
    RLError, RawFeatures, Result,
};

const PROBABILITY_EPS: f32 = 1e-6;

/// Scaling options that used to be module-level constants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessorOptions {
    /// Continuous features are clipped to `±max_feature_value` after z-scoring
    pub max_feature_value: f32,
    /// Range continuous actions are scaled into
    pub continuous_action_range: ContinuousActionRange,
}

impl Default for PreprocessorOptions {
    fn default() -> Self {
        Self {
            max_feature_value: 3.0,
            continuous_action_range: ContinuousActionRange::default(),
        }
    }
}

/// Maps raw dense or sparse features to a normalized matrix.
///
/// Raw dense columns follow feature-id order. Missing values (NaN, or
/// absent sparse keys) become zero in every output column of the feature.
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessor {
    features: Vec<(FeatureId, NormalizationParameters)>,
    options: PreprocessorOptions,
    output_dim: usize,
}

impl Preprocessor {
    /// Validate the parameters and fix the column layout
    pub fn new(data: &NormalizationData, options: PreprocessorOptions) -> Result<Self> {
        if data.num_features() == 0 {
            return Err(RLError::Configuration(
                "normalization data has no features".to_string(),
            ));
        }
        for (id, params) in &data.dense_normalization_parameters {
            validate(*id, params)?;
        }
        Ok(Self {
            features: data
                .dense_normalization_parameters
                .iter()
                .map(|(id, p)| (*id, p.clone()))
                .collect(),
            options,
            output_dim: data.output_dim(),
        })
    }

    /// Number of raw features
    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.features.len()
    }

    /// Number of normalized columns
    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// Feature ids in raw column order
    pub fn feature_ids(&self) -> impl Iterator<Item = FeatureId> + '_ {
        self.features.iter().map(|(id, _)| *id)
    }

    /// Scaling options
    #[must_use]
    pub fn options(&self) -> &PreprocessorOptions {
        &self.options
    }

    /// Normalize a `(batch, input_dim)` matrix of raw dense values
    pub fn transform(&self, raw: &Array2<f32>) -> Result<Array2<f32>> {
        if raw.ncols() != self.input_dim() {
            return Err(RLError::DimensionMismatch {
                expected: self.input_dim(),
                actual: raw.ncols(),
            });
        }
        let mut out = Array2::zeros((raw.nrows(), self.output_dim));
        for (row, mut out_row) in raw.rows().into_iter().zip(out.rows_mut()) {
            let mut col = 0;
            for ((_, params), &value) in self.features.iter().zip(row.iter()) {
                let width = params.output_dim();
                if !value.is_nan() {
                    if params.feature_type == FeatureType::Enum {
                        if let Some(index) = enum_index(params, value) {
                            out_row[col + index] = 1.0;
                        }
                    } else {
                        out_row[col] = self.scale(params, value);
                    }
                }
                col += width;
            }
        }
        Ok(out)
    }

    /// Normalize sparse rows, treating absent features as missing
    pub fn transform_sparse<'a, I>(&self, rows: I) -> Result<Array2<f32>>
    where
        I: IntoIterator<Item = &'a RawFeatures>,
    {
        self.transform(&self.densify(rows)?)
    }

    /// Gather sparse rows into raw dense columns, NaN where absent
    pub fn densify<'a, I>(&self, rows: I) -> Result<Array2<f32>>
    where
        I: IntoIterator<Item = &'a RawFeatures>,
    {
        let mut flat = Vec::new();
        let mut count = 0;
        for row in rows {
            flat.extend(
                self.features
                    .iter()
                    .map(|(id, _)| row.get(id).copied().unwrap_or(f32::NAN)),
            );
            count += 1;
        }
        Ok(Array2::from_shape_vec((count, self.input_dim()), flat)?)
    }

    fn scale(&self, params: &NormalizationParameters, value: f32) -> f32 {
        match params.feature_type {
            FeatureType::Binary => {
                if value == 0.0 {
                    0.0
                } else {
                    1.0
                }
            }
            FeatureType::Probability => {
                let p = value.clamp(PROBABILITY_EPS, 1.0 - PROBABILITY_EPS);
                (p / (1.0 - p)).ln()
            }
            FeatureType::Continuous => {
                let max = self.options.max_feature_value;
                ((value - params.mean) / params.stddev).clamp(-max, max)
            }
            FeatureType::ContinuousAction => {
                let (min, max) = action_bounds(params);
                let range = self.options.continuous_action_range;
                let unit = (value - min) / (max - min);
                (range.low + unit * range.width()).clamp(range.low, range.high)
            }
            FeatureType::DoNotPreprocess | FeatureType::Enum => value,
        }
    }
}

/// Inverts the continuous-action scaling for serving
#[derive(Debug, Clone, PartialEq)]
pub struct Postprocessor {
    bounds: Vec<(f32, f32)>,
    range: ContinuousActionRange,
}

impl Postprocessor {
    /// Build from the action normalization data; every feature must be a
    /// continuous action
    pub fn new(data: &NormalizationData, range: ContinuousActionRange) -> Result<Self> {
        let mut bounds = Vec::with_capacity(data.num_features());
        for (id, params) in &data.dense_normalization_parameters {
            if params.feature_type != FeatureType::ContinuousAction {
                return Err(RLError::Configuration(format!(
                    "action feature {id} is {:?}, expected CONTINUOUS_ACTION",
                    params.feature_type
                )));
            }
            validate(*id, params)?;
            bounds.push(action_bounds(params));
        }
        Ok(Self { bounds, range })
    }

    /// Number of action dimensions
    #[must_use]
    pub fn action_dim(&self) -> usize {
        self.bounds.len()
    }

    /// Map training-range actions back to environment bounds
    pub fn transform(&self, actions: &Array2<f32>) -> Result<Array2<f32>> {
        if actions.ncols() != self.bounds.len() {
            return Err(RLError::DimensionMismatch {
                expected: self.bounds.len(),
                actual: actions.ncols(),
            });
        }
        let mut out = actions.clone();
        for mut row in out.rows_mut() {
            for (value, &(min, max)) in row.iter_mut().zip(&self.bounds) {
                let unit = (*value - self.range.low) / self.range.width();
                *value = (min + unit * (max - min)).clamp(min, max);
            }
        }
        Ok(out)
    }
}

fn validate(id: FeatureId, params: &NormalizationParameters) -> Result<()> {
    match params.feature_type {
        FeatureType::Continuous if params.stddev <= 0.0 || !params.stddev.is_finite() => Err(
            RLError::Configuration(format!("feature {id} has non-positive stddev {}", params.stddev)),
        ),
        FeatureType::ContinuousAction => match (params.min_value, params.max_value) {
            (Some(min), Some(max)) if min < max => Ok(()),
            _ => Err(RLError::Configuration(format!(
                "continuous action feature {id} needs min_value < max_value"
            ))),
        },
        FeatureType::Enum if params.possible_values.as_ref().map_or(true, Vec::is_empty) => Err(
            RLError::Configuration(format!("enum feature {id} has no possible values")),
        ),
        _ => Ok(()),
    }
}

fn action_bounds(params: &NormalizationParameters) -> (f32, f32) {
    (
        params.min_value.unwrap_or(-1.0),
        params.max_value.unwrap_or(1.0),
    )
}

fn enum_index(params: &NormalizationParameters, value: f32) -> Option<usize> {
    params
        .possible_values
        .as_ref()?
        .iter()
        .position(|&v| v == value)
}

/// Argmax of a row, first index on ties
#[must_use]
pub fn argmax(row: ArrayView1<'_, f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_value), (i, &v)| {
            if v > best_value {
                (i, v)
            } else {
                (best, best_value)
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;
    use std::collections::BTreeMap;

    fn state_data() -> NormalizationData {
        let mut params = BTreeMap::new();
        params.insert(10, NormalizationParameters::of_type(FeatureType::Binary));
        params.insert(20, NormalizationParameters::continuous(1.0, 2.0, -10.0, 10.0));
        params.insert(30, NormalizationParameters::enumeration(vec![4.0, 7.0]));
        params.insert(40, NormalizationParameters::of_type(FeatureType::Probability));
        NormalizationData::new(params)
    }

    #[test]
    fn expands_and_scales_each_type() {
        let pre = Preprocessor::new(&state_data(), PreprocessorOptions::default()).unwrap();
        assert_eq!(pre.output_dim(), 5);

        let out = pre
            .transform(&arr2(&[[2.0, 3.0, 7.0, 0.5], [0.0, 100.0, 5.0, f32::NAN]]))
            .unwrap();
        assert_eq!(out.row(0).to_vec(), vec![1.0, 1.0, 0.0, 1.0, 0.0]);
        // clipped z-score, unknown enum value, missing probability
        assert_eq!(out.row(1).to_vec(), vec![0.0, 3.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn sparse_rows_treat_absent_features_as_missing() {
        let pre = Preprocessor::new(&state_data(), PreprocessorOptions::default()).unwrap();
        let row: RawFeatures = [(20, 3.0)].into_iter().collect();
        let out = pre.transform_sparse([&row]).unwrap();
        assert_eq!(out.row(0).to_vec(), vec![0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn action_scaling_round_trips_through_postprocessor() {
        let mut params = BTreeMap::new();
        params.insert(100, NormalizationParameters::continuous_action(-2.0, 2.0));
        let data = NormalizationData::new(params);
        let options = PreprocessorOptions::default();
        let pre = Preprocessor::new(&data, options).unwrap();
        let post = Postprocessor::new(&data, options.continuous_action_range).unwrap();

        let scaled = pre.transform(&arr2(&[[1.0]])).unwrap();
        assert_abs_diff_eq!(scaled[[0, 0]], 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(post.transform(&scaled).unwrap()[[0, 0]], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn rejects_degenerate_parameters() {
        let mut params = BTreeMap::new();
        params.insert(1, NormalizationParameters::continuous(0.0, 0.0, 0.0, 0.0));
        let err = Preprocessor::new(&NormalizationData::new(params), PreprocessorOptions::default())
            .unwrap_err();
        assert!(matches!(err, RLError::Configuration(_)));
    }
}
