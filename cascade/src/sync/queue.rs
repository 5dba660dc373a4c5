//! Bounded multi-producer multi-consumer queue with blocking push and pop.
//!
//! This is the engine's only backpressure mechanism: a producer pushing into a
//! full queue parks until a consumer frees a slot.
//!
//! # Example
//!
//! ```
//! use cascade::sync::BoundedQueue;
//!
//! let queue = BoundedQueue::<u32>::new(2);
//! queue.push(1).unwrap();
//! assert_eq!(queue.pop(), Some(1));
//!
//! queue.close();
//! assert_eq!(queue.pop(), None);
//! ```
//!
//! # Closing
//!
//! [`BoundedQueue::close`] rejects further pushes and wakes every waiter.
//! Consumers keep draining what is left and see `None` once the queue is empty,
//! which is how worker threads are told to exit.

use std::collections::VecDeque;
use std::time::Duration;

use minstant::Instant;
use parking_lot::{Condvar, Mutex};

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Returned by a push into a closed queue, handing the item back.
#[derive(Debug, PartialEq, Eq)]
pub struct Closed<T>(pub T);

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Pushes an item, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the item if the queue is (or becomes) closed.
    pub fn push(&self, item: T) -> Result<(), Closed<T>> {
        self.push_blocking(item, Timeout::Infinite)
            .map_err(|returned| Closed(returned))
    }

    /// Pushes an item, blocking up to `timeout` while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` on timeout or if the queue is closed.
    pub fn push_blocking(&self, item: T, timeout: Timeout) -> Result<(), T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(item);
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                drop(state);
                self.not_empty.notify_one();
                return Ok(());
            }
            match deadline {
                None => self.not_full.wait(&mut state),
                Some(dl) => {
                    let Some(remaining) = dl.checked_duration_since(Instant::now()) else {
                        return Err(item);
                    };
                    let _ = self.not_full.wait_for(&mut state, remaining);
                }
            }
        }
    }

    /// Attempts to push without blocking.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full or closed.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed || state.items.len() >= self.capacity {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pushes every item in order, blocking whenever the queue is full.
    ///
    /// Items are moved out of `items`, which is left empty on success.
    ///
    /// # Errors
    ///
    /// If the queue closes part way, the items not yet pushed stay in `items`.
    pub fn push_all(&self, items: &mut Vec<T>) -> Result<(), Closed<()>> {
        let mut pending = std::mem::take(items).into_iter();
        while let Some(item) = pending.next() {
            if let Err(Closed(item)) = self.push(item) {
                items.push(item);
                items.extend(pending);
                return Err(Closed(()));
            }
        }
        Ok(())
    }

    /// Pops an item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        self.pop_blocking(Timeout::Infinite)
    }

    /// Pops an item, blocking up to `timeout` while the queue is empty.
    ///
    /// Returns `None` on timeout or once the queue is closed and drained.
    pub fn pop_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            match deadline {
                None => self.not_empty.wait(&mut state),
                Some(dl) => {
                    let remaining = dl.checked_duration_since(Instant::now())?;
                    let _ = self.not_empty.wait_for(&mut state, remaining);
                }
            }
        }
    }

    /// Attempts to pop without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.items.pop_front();
        drop(state);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Rejects further pushes and wakes all blocked producers and consumers.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}
