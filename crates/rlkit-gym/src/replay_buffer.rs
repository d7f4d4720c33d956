//! Experience replay for online training

use std::collections::VecDeque;

use rand::seq::index;
use rand::RngCore;

use rlkit_core::{RLError, Result, Transition};

/// FIFO replay buffer of environment transitions
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    buffer: VecDeque<Transition>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Create a buffer holding at most `capacity` transitions
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(RLError::Configuration(
                "replay buffer capacity must be positive".to_string(),
            ));
        }
        Ok(Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Add a transition, evicting the oldest once full
    pub fn push(&mut self, transition: Transition) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(transition);
    }

    /// Sample `batch_size` distinct transitions.
    ///
    /// Returns `None` while the buffer holds fewer than `batch_size`.
    pub fn sample(&self, batch_size: usize, rng: &mut dyn RngCore) -> Option<Vec<Transition>> {
        if batch_size == 0 || self.buffer.len() < batch_size {
            return None;
        }
        let picked = index::sample(rng, self.buffer.len(), batch_size);
        Some(picked.iter().map(|i| self.buffer[i].clone()).collect())
    }

    /// Number of stored transitions
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Maximum number of stored transitions
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every stored transition
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
