//! The generic epoch loop shared by every model manager

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::info;

use rlkit_core::{RLError, Result, TransitionRow};
use rlkit_training::{BatchPreprocessor, ObserverHandle, Trainer};

use crate::evaluator::Evaluator;
use crate::types::{Dataset, ReaderOptions};

/// Where a reporter was attached before training started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReporterHandles {
    /// Handle on the trainer's observer set
    pub trainer: ObserverHandle,
    /// Handle on the evaluator's observer set
    pub evaluator: ObserverHandle,
}

fn preprocess_all<P: BatchPreprocessor>(
    preprocessor: &P,
    rows: &[TransitionRow],
    minibatch_size: usize,
) -> Result<Vec<P::Output>> {
    rows.chunks(minibatch_size)
        .map(|chunk| preprocessor.preprocess(chunk))
        .collect()
}

/// Train for `num_epochs` epochs, evaluating after each one.
///
/// The reporter behind `reporter` must already be attached to both the
/// trainer and the evaluator; otherwise nothing runs. Epochs and the batches
/// inside them run sequentially and the first error aborts the loop.
#[allow(clippy::too_many_arguments)]
pub fn train_and_evaluate_generic<T, P>(
    train_dataset: &Dataset,
    eval_dataset: Option<&Dataset>,
    trainer: &mut T,
    num_epochs: usize,
    batch_preprocessor: &P,
    evaluator: &mut Evaluator,
    reporter: ReporterHandles,
    reader_options: &ReaderOptions,
) -> Result<()>
where
    T: Trainer,
    P: BatchPreprocessor<Output = T::Batch>,
{
    if !trainer.observers().contains(reporter.trainer)
        || !evaluator.observers().contains(reporter.evaluator)
    {
        return Err(RLError::Precondition(
            "attach the reporter to the trainer and the evaluator before training".to_string(),
        ));
    }
    if reader_options.minibatch_size == 0 {
        return Err(RLError::Configuration("minibatch_size must be positive".to_string()));
    }
    if train_dataset.is_empty() {
        return Err(RLError::Precondition("training dataset is empty".to_string()));
    }

    // shuffled epochs permute one private copy of the rows in place
    let mut shuffled = reader_options.shuffle.then(|| {
        let rng = reader_options
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        (rng, train_dataset.rows.clone())
    });

    for epoch in 0..num_epochs {
        let rows: &[TransitionRow] = match &mut shuffled {
            Some((rng, rows)) => {
                rows.shuffle(rng);
                rows.as_slice()
            }
            None => &train_dataset.rows,
        };
        for chunk in rows.chunks(reader_options.minibatch_size) {
            trainer.train(batch_preprocessor.preprocess(chunk)?)?;
        }

        if let Some(eval) = eval_dataset.filter(|d| !d.is_empty()) {
            let batches =
                preprocess_all(batch_preprocessor, &eval.rows, reader_options.minibatch_size)?;
            evaluator.evaluate(trainer, &batches)?;
        }

        trainer.observers().notify_epoch_end(epoch)?;
        info!(epoch, minibatches = trainer.minibatch(), "epoch finished");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ndarray::Array2;
    use rlkit_core::{PolicyActionSet, TrainingMetrics};
    use rlkit_training::{ObserverSet, TrainingBatch, TrainingObserver};

    use super::*;

    /// Sequence numbers of the rows in a batch
    struct Sequence(Vec<i64>);

    impl TrainingBatch for Sequence {
        fn batch_size(&self) -> usize {
            self.0.len()
        }

        fn check_rows(&self) -> Result<()> {
            Ok(())
        }
    }

    struct SequencePreprocessor;

    impl BatchPreprocessor for SequencePreprocessor {
        type Output = Sequence;

        fn preprocess(&self, rows: &[TransitionRow]) -> Result<Sequence> {
            Ok(Sequence(rows.iter().map(|r| r.sequence_number).collect()))
        }
    }

    #[derive(Default)]
    struct RecordingTrainer {
        seen: Vec<Vec<i64>>,
        observers: ObserverSet,
    }

    impl Trainer for RecordingTrainer {
        type Batch = Sequence;

        fn train(&mut self, batch: Sequence) -> Result<TrainingMetrics> {
            self.seen.push(batch.0);
            let metrics = TrainingMetrics::new();
            self.observers.notify_train_step(self.seen.len(), &metrics)?;
            Ok(metrics)
        }

        fn evaluate(&self, _batch: &Sequence) -> Result<TrainingMetrics> {
            Ok(TrainingMetrics::new())
        }

        fn minibatch(&self) -> usize {
            self.seen.len()
        }

        fn internal_prediction(&self, _state: &Array2<f32>) -> Result<PolicyActionSet> {
            Err(RLError::NotImplemented("recording trainer".to_string()))
        }

        fn observers(&self) -> &ObserverSet {
            &self.observers
        }

        fn observers_mut(&mut self) -> &mut ObserverSet {
            &mut self.observers
        }
    }

    struct Silent;

    impl TrainingObserver for Silent {}

    fn dataset(n: i64) -> Dataset {
        let rows = (0..n)
            .map(|seq| {
                serde_json::from_str(&format!(
                    r#"{{"mdp_id":"m","sequence_number":{seq},"state_features":{{}},
                        "action":{{"Discrete":"L"}},"reward":0.0}}"#
                ))
                .unwrap()
            })
            .collect();
        Dataset::new(rows)
    }

    fn run(options: &ReaderOptions, num_epochs: usize) -> Vec<Vec<i64>> {
        let mut trainer = RecordingTrainer::default();
        let mut evaluator = Evaluator::new();
        let observer: rlkit_training::SharedObserver = Arc::new(Mutex::new(Silent));
        let handles = ReporterHandles {
            trainer: trainer.add_observer(observer.clone()),
            evaluator: evaluator.add_observer(observer),
        };
        train_and_evaluate_generic(
            &dataset(10),
            Some(&dataset(3)),
            &mut trainer,
            num_epochs,
            &SequencePreprocessor,
            &mut evaluator,
            handles,
            options,
        )
        .unwrap();
        assert_eq!(evaluator.epoch(), num_epochs);
        trainer.seen
    }

    #[test]
    fn unshuffled_epochs_replay_rows_in_order() {
        let options = ReaderOptions {
            minibatch_size: 4,
            ..ReaderOptions::default()
        };
        let seen = run(&options, 2);
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], vec![0, 1, 2, 3]);
        assert_eq!(seen[2], vec![8, 9]);
        assert_eq!(seen[3], seen[0]);
    }

    #[test]
    fn shuffled_epochs_cover_every_row_once_and_repeat_with_the_seed() {
        let options = ReaderOptions {
            minibatch_size: 3,
            shuffle: true,
            seed: Some(11),
        };
        let seen = run(&options, 3);
        assert_eq!(seen.len(), 12);
        for epoch in seen.chunks(4) {
            let mut rows: Vec<i64> = epoch.iter().flatten().copied().collect();
            rows.sort_unstable();
            assert_eq!(rows, (0..10).collect::<Vec<_>>());
        }
        assert_eq!(run(&options, 3), seen);
    }
}
