//! The trainer contract and the observer protocol around it

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ndarray::{Array1, Array2};

use rlkit_core::{PolicyActionSet, RLError, Result, TrainingMetrics};

use crate::types::TrainingBatch;

/// Network shared between a trainer and the policies reading its live weights
pub type SharedNetwork<N> = Arc<RwLock<N>>;

/// Wrap a network for sharing
pub fn share<N>(network: N) -> SharedNetwork<N> {
    Arc::new(RwLock::new(network))
}

/// Read access to a shared network
pub fn read_network<N>(network: &SharedNetwork<N>) -> Result<RwLockReadGuard<'_, N>> {
    network
        .read()
        .map_err(|_| RLError::Computation("network lock poisoned".to_string()))
}

/// Write access to a shared network
pub fn write_network<N>(network: &SharedNetwork<N>) -> Result<RwLockWriteGuard<'_, N>> {
    network
        .write()
        .map_err(|_| RLError::Computation("network lock poisoned".to_string()))
}

/// Receives metric callbacks from trainers and evaluators
pub trait TrainingObserver: Send {
    /// Called after every training step with that step's metrics
    fn on_train_step(&mut self, minibatch: usize, metrics: &TrainingMetrics) {
        let _ = (minibatch, metrics);
    }

    /// Called after every evaluation pass
    fn on_evaluation(&mut self, epoch: usize, metrics: &TrainingMetrics) {
        let _ = (epoch, metrics);
    }

    /// Called once an epoch has finished
    fn on_epoch_end(&mut self, epoch: usize) {
        let _ = epoch;
    }
}

/// Observer shared between the caller and every component it is attached to
pub type SharedObserver = Arc<Mutex<dyn TrainingObserver>>;

/// Token returned by [`ObserverSet::attach`], used to detach the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

/// Ordered set of attached observers
#[derive(Default, Clone)]
pub struct ObserverSet {
    next_id: u64,
    observers: Vec<(ObserverHandle, SharedObserver)>,
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("attached", &self.observers.len())
            .finish()
    }
}

impl ObserverSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer; it is notified after the ones attached earlier
    pub fn attach(&mut self, observer: SharedObserver) -> ObserverHandle {
        let handle = ObserverHandle(self.next_id);
        self.next_id += 1;
        self.observers.push((handle, observer));
        handle
    }

    /// Detach an observer, returning it if the handle was live
    pub fn detach(&mut self, handle: ObserverHandle) -> Option<SharedObserver> {
        let position = self.observers.iter().position(|(h, _)| *h == handle)?;
        Some(self.observers.remove(position).1)
    }

    /// Whether `handle` is attached
    #[must_use]
    pub fn contains(&self, handle: ObserverHandle) -> bool {
        self.observers.iter().any(|(h, _)| *h == handle)
    }

    /// Number of attached observers
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether nothing is attached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Forward a training step
    pub fn notify_train_step(&self, minibatch: usize, metrics: &TrainingMetrics) -> Result<()> {
        self.for_each(|o| o.on_train_step(minibatch, metrics))
    }

    /// Forward an evaluation result
    pub fn notify_evaluation(&self, epoch: usize, metrics: &TrainingMetrics) -> Result<()> {
        self.for_each(|o| o.on_evaluation(epoch, metrics))
    }

    /// Forward the end of an epoch
    pub fn notify_epoch_end(&self, epoch: usize) -> Result<()> {
        self.for_each(|o| o.on_epoch_end(epoch))
    }

    fn for_each<F: FnMut(&mut dyn TrainingObserver)>(&self, mut f: F) -> Result<()> {
        for (_, observer) in &self.observers {
            let mut guard = observer
                .lock()
                .map_err(|_| RLError::Computation("observer lock poisoned".to_string()))?;
            f(&mut *guard);
        }
        Ok(())
    }
}

/// One algorithm's parameter-update step.
///
/// A trainer owns its networks and a minibatch counter that grows by one per
/// successful [`Trainer::train`] call. Errors are never swallowed: a failing
/// step leaves the counter untouched and propagates to the caller.
pub trait Trainer: Send {
    /// Batch layout this trainer consumes
    type Batch: TrainingBatch;

    /// Run one update step, consuming the batch
    fn train(&mut self, batch: Self::Batch) -> Result<TrainingMetrics>;

    /// Compute evaluation metrics without updating parameters
    fn evaluate(&self, batch: &Self::Batch) -> Result<TrainingMetrics>;

    /// Number of completed training steps
    fn minibatch(&self) -> usize;

    /// Direct inference on normalized states
    fn internal_prediction(&self, state: &Array2<f32>) -> Result<PolicyActionSet>;

    /// Predicted rewards for normalized state/action pairs
    fn internal_reward_estimation(
        &self,
        state: &Array2<f32>,
        action: &Array2<f32>,
    ) -> Result<Array1<f32>> {
        let _ = (state, action);
        Err(RLError::NotImplemented(
            "reward estimation is not wired up for this trainer".to_string(),
        ))
    }

    /// Attached observers
    fn observers(&self) -> &ObserverSet;

    /// Attached observers, mutably
    fn observers_mut(&mut self) -> &mut ObserverSet;

    /// Attach an observer notified after every training step
    fn add_observer(&mut self, observer: SharedObserver) -> ObserverHandle {
        self.observers_mut().attach(observer)
    }

    /// Detach an observer; returns whether it was attached
    fn remove_observer(&mut self, handle: ObserverHandle) -> bool {
        self.observers_mut().detach(handle).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counting {
        steps: Vec<usize>,
    }

    impl TrainingObserver for Counting {
        fn on_train_step(&mut self, minibatch: usize, _metrics: &TrainingMetrics) {
            self.steps.push(minibatch);
        }
    }

    #[test]
    fn detached_observers_stop_receiving() {
        let observer = Arc::new(Mutex::new(Counting::default()));
        let mut set = ObserverSet::new();
        let handle = set.attach(observer.clone());

        set.notify_train_step(0, &TrainingMetrics::new()).unwrap();
        assert!(set.detach(handle).is_some());
        assert!(set.detach(handle).is_none());
        set.notify_train_step(1, &TrainingMetrics::new()).unwrap();

        assert_eq!(observer.lock().unwrap().steps, vec![0]);
    }

    #[test]
    fn handles_are_unique() {
        let mut set = ObserverSet::new();
        let a = set.attach(Arc::new(Mutex::new(Counting::default())));
        let b = set.attach(Arc::new(Mutex::new(Counting::default())));
        assert_ne!(a, b);
        assert!(set.contains(a) && set.contains(b));
        assert_eq!(set.len(), 2);
    }
}
