//! Schedules, target-network averaging and running statistics

use std::collections::VecDeque;

use ndarray::{Array1, ArrayView1};
use rand::Rng;

/// Trait for schedules (e.g., for temperature decay)
pub trait Schedule: Send + Sync {
    /// Get value at step t
    fn value(&self, t: usize) -> f32;
}

/// Linear schedule that decays from start to end over steps
#[derive(Debug, Clone)]
pub struct LinearSchedule {
    /// Starting value
    pub start: f32,
    /// Ending value
    pub end: f32,
    /// Number of steps for decay
    pub steps: usize,
}

impl LinearSchedule {
    /// Create a new linear schedule
    #[must_use]
    pub fn new(start: f32, end: f32, steps: usize) -> Self {
        Self { start, end, steps }
    }
}

impl Schedule for LinearSchedule {
    #[allow(clippy::cast_precision_loss)]
    fn value(&self, t: usize) -> f32 {
        if t >= self.steps {
            self.end
        } else {
            let progress = t as f32 / self.steps as f32;
            self.start + (self.end - self.start) * progress
        }
    }
}

/// Exponential decay schedule
#[derive(Debug, Clone)]
pub struct ExponentialSchedule {
    /// Starting value
    pub start: f32,
    /// Minimum value
    pub min_value: f32,
    /// Decay rate
    pub decay_rate: f32,
}

impl ExponentialSchedule {
    /// Create a new exponential schedule
    #[must_use]
    pub fn new(start: f32, min_value: f32, decay_rate: f32) -> Self {
        Self {
            start,
            min_value,
            decay_rate,
        }
    }
}

impl Schedule for ExponentialSchedule {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn value(&self, t: usize) -> f32 {
        let value = self.start * self.decay_rate.powi(t.min(i32::MAX as usize) as i32);
        value.max(self.min_value)
    }
}

/// Polyak averaging for target network updates
#[must_use]
pub fn polyak_update(target_weight: f32, source_weight: f32, tau: f32) -> f32 {
    tau * source_weight + (1.0 - tau) * target_weight
}

/// Softmax of `scores / temperature`, shifted by the max for stability
#[must_use]
pub fn softmax(scores: ArrayView1<'_, f32>, temperature: f32) -> Array1<f32> {
    let temperature = temperature.max(f32::MIN_POSITIVE);
    let max = scores.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp = scores.mapv(|v| ((v - max) / temperature).exp());
    let sum = exp.sum();
    exp / sum
}

/// Draw an index from a categorical distribution
pub fn sample_categorical<R: Rng + ?Sized>(probs: ArrayView1<'_, f32>, rng: &mut R) -> usize {
    let draw: f32 = rng.gen();
    let mut cumulative = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if draw < cumulative {
            return i;
        }
    }
    // rounding left the cumulative sum slightly below one
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(probs.len().saturating_sub(1))
}

/// Mean over the most recent `window` values
#[derive(Debug, Clone)]
pub struct RollingMean {
    values: VecDeque<f32>,
    window: usize,
}

impl RollingMean {
    /// Create an empty window; a zero window keeps one value
    #[must_use]
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            values: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Record a value, evicting the oldest one when full
    pub fn push(&mut self, value: f32) {
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Mean of the retained values, zero when empty
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f32 {
        if self.values.is_empty() {
            0.0
        } else {
            self.values.iter().sum::<f32>() / self.values.len() as f32
        }
    }

    /// Number of retained values
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no value has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn linear_schedule_clamps_at_end() {
        let schedule = LinearSchedule::new(1.0, 0.0, 10);
        assert_relative_eq!(schedule.value(5), 0.5);
        assert_relative_eq!(schedule.value(50), 0.0);
    }

    #[test]
    fn exponential_schedule_respects_floor() {
        let schedule = ExponentialSchedule::new(1.0, 0.1, 0.5);
        assert_relative_eq!(schedule.value(1), 0.5);
        assert_relative_eq!(schedule.value(10), 0.1);
    }

    #[test]
    fn rolling_mean_evicts_oldest() {
        let mut mean = RollingMean::new(2);
        mean.push(1.0);
        mean.push(2.0);
        mean.push(4.0);
        assert_eq!(mean.len(), 2);
        assert_relative_eq!(mean.mean(), 3.0);
    }

    #[test]
    fn softmax_sharpens_with_low_temperature() {
        let scores = ndarray::arr1(&[1.0, 2.0, 0.5]);
        let warm = softmax(scores.view(), 10.0);
        let cold = softmax(scores.view(), 0.01);
        assert_relative_eq!(warm.sum(), 1.0, epsilon = 1e-5);
        assert!(cold[1] > 0.999);
        assert!(warm[1] < 0.5);
    }

    #[test]
    fn categorical_never_picks_zero_mass() {
        let probs = ndarray::arr1(&[0.0, 1.0, 0.0]);
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            assert_eq!(sample_categorical(probs.view(), &mut rng), 1);
        }
    }

    #[test]
    fn polyak_interpolates() {
        assert_relative_eq!(polyak_update(0.0, 1.0, 0.25), 0.25);
    }
}
