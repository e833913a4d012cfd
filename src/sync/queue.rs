//! Mutex-guarded double-ended queue with a blocking wait
//!
//! Used for each connection's outbound queue and for the inbound queue an
//! endpoint shares with its connections. Every method is individually
//! atomic; pairs such as `is_empty` then `pop_front` are not, so the
//! combined operations below exist for callers that need them.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// Thread-safe double-ended queue
#[derive(Debug)]
pub struct ThreadSafeQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> ThreadSafeQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Insert at the front and wake one waiter
    pub fn push_front(&self, item: T) {
        self.items.lock().push_front(item);
        self.ready.notify_one();
    }

    /// Insert at the back and wake one waiter
    pub fn push_back(&self, item: T) {
        self.items.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Insert at the back, reporting whether the queue was empty beforehand
    pub fn push_back_was_empty(&self, item: T) -> bool {
        let was_empty = {
            let mut items = self.items.lock();
            let was_empty = items.is_empty();
            items.push_back(item);
            was_empty
        };
        self.ready.notify_one();
        was_empty
    }

    /// Insert at the back unless the queue already holds `limit` items.
    ///
    /// Returns whether the queue was empty beforehand, or hands the item
    /// back when the queue is full.
    pub fn push_back_bounded(&self, item: T, limit: usize) -> Result<bool, T> {
        let was_empty = {
            let mut items = self.items.lock();
            if items.len() >= limit {
                return Err(item);
            }
            let was_empty = items.is_empty();
            items.push_back(item);
            was_empty
        };
        self.ready.notify_one();
        Ok(was_empty)
    }

    /// Remove the front item, `None` if the queue is empty
    pub fn pop_front(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Remove the back item, `None` if the queue is empty
    pub fn pop_back(&self) -> Option<T> {
        self.items.lock().pop_back()
    }

    /// Run `f` against the front item without removing it
    pub fn with_front<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.items.lock().front().map(f)
    }

    pub fn front(&self) -> Option<T>
    where
        T: Clone,
    {
        self.items.lock().front().cloned()
    }

    pub fn back(&self) -> Option<T>
    where
        T: Clone,
    {
        self.items.lock().back().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Block until the queue holds at least one item
    pub fn wait(&self) {
        let mut items = self.items.lock();
        while items.is_empty() {
            self.ready.wait(&mut items);
        }
    }

    /// Block until the queue is non-empty or `timeout` elapses.
    /// Returns true if the queue is non-empty on return.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut items = self.items.lock();
        if items.is_empty() {
            // Spurious wakeups are re-checked by wait_while_for
            self.ready
                .wait_while_for(&mut items, |items| items.is_empty(), timeout);
        }
        !items.is_empty()
    }
}

impl<T> Default for ThreadSafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
