//! Fixed-capacity FIFO ring buffer with checked push/pop
//!
//! The protocol layer queues pending outbound inputs, wire messages, and
//! events in rings with hard capacity ceilings. Overflow is an explicit
//! `Err(RingFull)` result rather than an assertion, so callers decide
//! whether a full queue is fatal (programmer error) or policy (drop the
//! oldest, disconnect the laggard).

use std::collections::VecDeque;

/// Error returned when pushing into a full ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

impl std::fmt::Display for RingFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ring buffer full")
    }
}

impl std::error::Error for RingFull {}

/// Bounded FIFO queue.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than 0");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add an item to the back. Returns `Err(RingFull)` when at capacity.
    pub fn push(&mut self, item: T) -> Result<(), RingFull> {
        if self.items.len() >= self.capacity {
            return Err(RingFull);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Remove and return the front item.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Peek at the front item.
    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// The i-th item counted from the front.
    pub fn get(&self, i: usize) -> Option<&T> {
        self.items.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
