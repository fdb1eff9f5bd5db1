//! Thread-safe FIFO queue with an optional size bound

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    max_size: usize,
    waiting: usize,
}

impl<T> Inner<T> {
    fn is_full(&self) -> bool {
        self.max_size > 0 && self.items.len() >= self.max_size
    }
}

/// FIFO shared between threads.
///
/// A `max_size` of zero means unbounded. Producers block in [`put`] while the
/// queue is full, consumers block in [`get`] while it is empty.
///
/// [`put`]: BoundedQueue::put
/// [`get`]: BoundedQueue::get
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    empty: Condvar,
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(max_size: usize) -> Self {
        BoundedQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                max_size,
                waiting: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            empty: Condvar::new(),
        }
    }

    /// Appends `item`, blocking while the queue is full. `force` appends
    /// regardless of the bound.
    pub fn put(&self, item: T, force: bool) {
        let mut inner = self.inner.lock();
        while !force && inner.is_full() {
            self.not_full.wait(&mut inner);
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Like [`put`](Self::put) without `force`, giving the item back if the
    /// queue stays full for `timeout`.
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.is_full() {
            if self.not_full.wait_until(&mut inner, deadline).timed_out() && inner.is_full() {
                return Err(item);
            }
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the front item, blocking while the queue is empty.
    pub fn get(&self) -> T {
        let mut inner = self.inner.lock();
        inner.waiting += 1;
        let item = loop {
            if let Some(item) = inner.items.pop_front() {
                break item;
            }
            self.not_empty.wait(&mut inner);
        };
        inner.waiting -= 1;
        self.after_removal(&inner);
        item
    }

    /// Removes the front item, waiting at most `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        inner.waiting += 1;
        let item = loop {
            if let Some(item) = inner.items.pop_front() {
                break Some(item);
            }
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                break inner.items.pop_front();
            }
        };
        inner.waiting -= 1;
        if item.is_some() {
            self.after_removal(&inner);
        }
        item
    }

    pub fn try_get(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front();
        if item.is_some() {
            self.after_removal(&inner);
        }
        item
    }

    fn after_removal(&self, inner: &Inner<T>) {
        self.not_full.notify_one();
        if inner.items.is_empty() {
            self.empty.notify_all();
        }
    }

    /// Erases the first element equal to `item`. Returns whether one was found.
    pub fn remove(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.items.iter().position(|x| x == item) else {
            return false;
        };
        inner.items.remove(pos);
        self.after_removal(&inner);
        true
    }

    /// Changes the bound. Raising it wakes blocked producers.
    pub fn set_max_size(&self, max_size: usize) {
        let mut inner = self.inner.lock();
        inner.max_size = max_size;
        self.not_full.notify_all();
    }

    pub fn max_size(&self) -> usize {
        self.inner.lock().max_size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Number of consumers blocked in `get` or `get_timeout`.
    pub fn num_waiting(&self) -> usize {
        self.inner.lock().waiting
    }

    /// Waits until the queue drains. False if it is still non-empty after
    /// `timeout`.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.items.is_empty() {
            if self.empty.wait_until(&mut inner, deadline).timed_out() {
                return inner.items.is_empty();
            }
        }
        true
    }
}
