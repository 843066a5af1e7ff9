//! Fixed-capacity FIFO shared between producer and consumer threads.
use std::collections::VecDeque;

use parking_lot::Mutex;

/// A bounded FIFO ring with interior locking.
///
/// Pushes and pops may come from different threads; callers provide the
/// higher-level ordering (a single pushing lock and a single popping lock).
/// Accessors that look at the front or back element take a closure so that no
/// reference can outlive the internal guard.
pub(crate) struct FixedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> FixedQueue<T> {
    pub(crate) fn new(capacity: usize) -> FixedQueue<T> {
        assert!(capacity > 0, "fixed queue capacity must be non-zero");
        FixedQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.inner.lock().len() == self.capacity
    }

    /// Panics if the queue is full; callers must reserve space first.
    pub(crate) fn push(&self, value: T) {
        let mut inner = self.inner.lock();
        assert!(inner.len() < self.capacity, "fixed queue overflow");
        inner.push_back(value);
    }

    pub(crate) fn pop_front(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    pub(crate) fn front<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.lock().front().map(f)
    }

    pub(crate) fn back<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.lock().back().map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_order() {
        let q = FixedQueue::new(3);
        q.push(1);
        q.push(2);
        q.push(3);
        assert!(q.is_full());
        assert_eq!(q.pop_front(), Some(1));
        assert_eq!(q.pop_front(), Some(2));
        q.push(4);
        assert_eq!(q.pop_front(), Some(3));
        assert_eq!(q.pop_front(), Some(4));
        assert!(q.is_empty());
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn front_and_back_are_scoped() {
        let q = FixedQueue::new(2);
        assert_eq!(q.front(|v: &u32| *v), None);
        q.push(7);
        q.push(9);
        assert_eq!(q.front(|v| *v), Some(7));
        assert_eq!(q.back(|v| *v), Some(9));
        assert_eq!(q.len(), 2);
    }

    #[test]
    #[should_panic(expected = "fixed queue overflow")]
    fn push_past_capacity_panics() {
        let q = FixedQueue::new(1);
        q.push(1);
        q.push(2);
    }
}
