use std::collections::VecDeque;

use bytes::Bytes;

/// Bounded FIFO of input payloads awaiting a writable transport. Overflow
/// drops the oldest entry and counts it.
#[derive(Debug)]
pub struct RetryQueue {
    entries: VecDeque<Bytes>,
    capacity: usize,
    dropped: usize,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Append `bytes`; returns true when an older entry had to be dropped.
    pub fn push_back(&mut self, bytes: Bytes) -> bool {
        let overflow = self.entries.len() >= self.capacity;
        if overflow {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(bytes);
        overflow
    }

    /// Put back an entry that was just popped and could not be written.
    pub fn push_front(&mut self, bytes: Bytes) {
        if self.entries.len() >= self.capacity {
            self.dropped += 1;
            return;
        }
        self.entries.push_front(bytes);
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        self.entries.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.entries.drain(..)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}
