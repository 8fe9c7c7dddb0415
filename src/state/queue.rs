//! Thread-safe FIFO shared between pipeline components

use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// Unbounded multi-producer multi-consumer FIFO
///
/// Bounding is caller policy: producers check [`BoundedQueue::len`] against
/// their configured threshold before pushing. Order is preserved per
/// producer only.
pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> BoundedQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Appends one element
    pub fn push(&self, value: T) {
        // Both ends live in self, so the channel can never be disconnected here
        let _ = self.tx.send(value);
    }

    /// Appends every element of `values` in order
    pub fn push_batch<I>(&self, values: I)
    where
        I: IntoIterator<Item = T>,
    {
        for value in values {
            self.push(value);
        }
    }

    /// Removes and returns the oldest element, if any
    pub fn pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Removes up to `limit` of the oldest elements
    pub fn pop_up_to(&self, limit: usize) -> Vec<T> {
        let mut batch = Vec::with_capacity(limit.min(self.len()));
        while batch.len() < limit {
            match self.pop() {
                Some(value) => batch.push(value),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
