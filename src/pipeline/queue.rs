//! Bounded frame queue: the hand-off point between engine worker threads
//! and the consumer.
//!
//! The consumer polls or pulls with a timeout; it is never invoked on an
//! engine thread, so a slow consumer cannot stall media processing. Capacity
//! is explicit and the overflow policy is chosen at construction: unbounded
//! growth is not an option.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::StreamError;

/// What `push` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for space up to the given duration, then reject the frame
    Block(Duration),
    /// Evict the oldest queued frame to make room
    DropOldest,
    /// Reject the incoming frame, leaving the queue untouched
    DropNewest,
}

struct Inner<T> {
    buf: VecDeque<T>,
    closed: bool,
}

/// Bounded, thread-safe FIFO.
pub struct FrameQueue<T> {
    stream: String,
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> FrameQueue<T> {
    pub fn new(stream: impl Into<String>, capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "frame queue capacity must be positive");
        Self {
            stream: stream.into(),
            capacity,
            policy,
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue one item under the configured overflow policy.
    ///
    /// Returns `QueueOverflow` when the policy rejected the item; the caller
    /// counts the drop and moves on. Returns `Ok(evicted)` otherwise, where
    /// `evicted` is the frame displaced by `DropOldest`, if any.
    pub fn push(&self, item: T) -> Result<Option<T>, StreamError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(StreamError::QueueOverflow {
                stream: self.stream.clone(),
            });
        }

        if inner.buf.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Block(timeout) => {
                    let deadline = Instant::now() + timeout;
                    while inner.buf.len() >= self.capacity && !inner.closed {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(StreamError::QueueOverflow {
                                stream: self.stream.clone(),
                            });
                        }
                        let (guard, _) = self
                            .not_full
                            .wait_timeout(inner, deadline - now)
                            .unwrap();
                        inner = guard;
                    }
                    if inner.closed {
                        return Err(StreamError::QueueOverflow {
                            stream: self.stream.clone(),
                        });
                    }
                }
                OverflowPolicy::DropOldest => {
                    let evicted = inner.buf.pop_front();
                    inner.buf.push_back(item);
                    self.not_empty.notify_one();
                    return Ok(evicted);
                }
                OverflowPolicy::DropNewest => {
                    return Err(StreamError::QueueOverflow {
                        stream: self.stream.clone(),
                    });
                }
            }
        }

        inner.buf.push_back(item);
        self.not_empty.notify_one();
        Ok(None)
    }

    /// Non-blocking poll.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.buf.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Pull one item, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout, or immediately once the queue is closed and
    /// drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.buf.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.not_empty.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Close the queue: producers are rejected, consumers drain what is left.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Discard everything queued, returning how many items were dropped.
    pub fn drain(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.buf.len();
        inner.buf.clear();
        self.not_full.notify_all();
        count
    }
}
