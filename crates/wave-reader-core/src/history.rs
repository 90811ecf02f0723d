//! Bounded FIFO history for processed messages.
//!
//! Both the dispatcher and the router keep a rolling copy of what they
//! processed. When full, pushing evicts the oldest entry.

use std::collections::VecDeque;

/// A fixed-capacity FIFO buffer.
///
/// Iteration yields items from oldest to newest.
///
/// ```ignore
/// let mut h = BoundedHistory::new(2);
/// h.push(1);
/// h.push(2);
/// assert_eq!(h.push(3), Some(1));
/// assert_eq!(h.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    items: VecDeque<T>,
    capacity: usize,
    total: u64,
}

impl<T> BoundedHistory<T> {
    /// Create an empty history.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    /// Append an item, returning the evicted oldest item when full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        self.total += 1;
        evicted
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// The newest `n` items, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip)
    }

    /// Most recently pushed item.
    #[must_use]
    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items ever pushed (including evicted ones).
    #[must_use]
    pub fn total_pushed(&self) -> u64 {
        self.total
    }

    /// Total items no longer held, whether evicted or cleared.
    #[must_use]
    pub fn total_evicted(&self) -> u64 {
        self.total.saturating_sub(self.items.len() as u64)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
