//! Per-epoch evaluation of a trainer on held-out batches

use indexmap::IndexMap;
use tracing::info;

use rlkit_core::{RLError, Result, TrainingMetrics};
use rlkit_training::{ObserverHandle, ObserverSet, SharedObserver, Trainer, TrainingBatch};

/// Averages [`Trainer::evaluate`] over an evaluation dataset and forwards the
/// result to its observers
#[derive(Debug, Default)]
pub struct Evaluator {
    observers: ObserverSet,
    epoch: usize,
}

impl Evaluator {
    /// Evaluator without observers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer notified after every evaluation
    pub fn add_observer(&mut self, observer: SharedObserver) -> ObserverHandle {
        self.observers.attach(observer)
    }

    /// Detach an observer; returns whether it was attached
    pub fn remove_observer(&mut self, handle: ObserverHandle) -> bool {
        self.observers.detach(handle).is_some()
    }

    /// Attached observers
    #[must_use]
    pub fn observers(&self) -> &ObserverSet {
        &self.observers
    }

    /// Evaluations run so far
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Evaluate `trainer` on every batch and return the row-weighted mean of
    /// each metric
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn evaluate<T: Trainer>(
        &mut self,
        trainer: &T,
        batches: &[T::Batch],
    ) -> Result<TrainingMetrics> {
        let mut sums: IndexMap<String, f64> = IndexMap::new();
        let mut rows = 0_usize;
        for batch in batches {
            let n = batch.batch_size();
            for (key, value) in trainer.evaluate(batch)? {
                *sums.entry(key).or_insert(0.0) += f64::from(value) * n as f64;
            }
            rows += n;
        }
        if rows == 0 {
            return Err(RLError::Precondition(
                "cannot evaluate on an empty dataset".to_string(),
            ));
        }

        let metrics: TrainingMetrics = sums
            .into_iter()
            .map(|(key, sum)| (key, (sum / rows as f64) as f32))
            .collect();
        info!(epoch = self.epoch, rows, ?metrics, "evaluation finished");
        self.observers.notify_evaluation(self.epoch, &metrics)?;
        self.epoch += 1;
        Ok(metrics)
    }
}
