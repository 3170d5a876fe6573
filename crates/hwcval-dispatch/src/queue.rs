//! Bounded blocking event queue.
//!
//! Producers never block: when the queue is full the [`OverflowPolicy`] decides whether the
//! oldest entry is evicted or the new one is handed back. Consumers may poll, block, or block
//! with a timeout. Once closed, the queue rejects pushes and consumers drain what is left.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest entry to make room.
    #[default]
    DropOldest,
    /// Hand the new entry back to the producer.
    Reject,
}

/// Log level of the overflow check raised whenever an entry is evicted or refused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowSeverity {
    Debug,
    #[default]
    Warning,
    Error,
}

/// A push that did not enqueue; carries the entry back to the caller.
#[derive(Error, PartialEq, Eq)]
pub enum QueueError<T> {
    #[error("queue is full")]
    Full(T),
    #[error("queue is closed")]
    Closed(T),
}

impl<T> QueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(entry) | Self::Closed(entry) => entry,
        }
    }
}

impl<T> fmt::Debug for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

struct State<T> {
    name: String,
    overflow_severity: OverflowSeverity,
    entries: VecDeque<T>,
    closed: bool,
}

pub struct EventQueue<T> {
    capacity: usize,
    overflow: OverflowPolicy,
    state: Mutex<State<T>>,
    available: Condvar,
    /// Entries evicted by `DropOldest` plus entries refused by `Reject`.
    dropped: AtomicU64,
}

impl<T> EventQueue<T> {
    /// A zero capacity is treated as one.
    pub fn new(name: impl Into<String>, capacity: usize, overflow: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            overflow,
            state: Mutex::new(State {
                name: name.into(),
                overflow_severity: OverflowSeverity::default(),
                entries: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `entry`. Returns the evicted entry when [`OverflowPolicy::DropOldest`] had to make
    /// room.
    pub fn push(&self, entry: T) -> Result<Option<T>, QueueError<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed(entry));
        }

        let mut evicted = None;
        if state.entries.len() >= self.capacity {
            let dropped = self.dropped.fetch_add(1, Ordering::AcqRel) + 1;
            self.report_overflow(&state, dropped);
            match self.overflow {
                OverflowPolicy::Reject => return Err(QueueError::Full(entry)),
                OverflowPolicy::DropOldest => evicted = state.entries.pop_front(),
            }
        }
        state.entries.push_back(entry);
        drop(state);
        self.available.notify_one();
        Ok(evicted)
    }

    fn report_overflow(&self, state: &State<T>, dropped: u64) {
        let (queue, capacity, policy) = (&state.name, self.capacity, self.overflow);
        match state.overflow_severity {
            OverflowSeverity::Debug => {
                tracing::debug!(%queue, capacity, ?policy, dropped, "event queue full")
            }
            OverflowSeverity::Warning => {
                tracing::warn!(%queue, capacity, ?policy, dropped, "event queue full")
            }
            OverflowSeverity::Error => {
                tracing::error!(%queue, capacity, ?policy, dropped, "event queue full")
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().entries.pop_front()
    }

    /// Block until an entry is available. `None` once the queue is closed and drained.
    pub fn pop_wait(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(entry) = state.entries.pop_front() {
                return Some(entry);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// As [`EventQueue::pop_wait`], giving up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.pop_wait();
        };
        let mut state = self.lock();
        loop {
            if let Some(entry) = state.entries.pop_front() {
                return Some(entry);
            }
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Discard every queued entry, returning how many were dropped.
    pub fn flush(&self) -> usize {
        let mut state = self.lock();
        let n = state.entries.len();
        state.entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Entries lost to overflow so far, evicted or refused.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn overflow_severity(&self) -> OverflowSeverity {
        self.lock().overflow_severity
    }

    pub fn set_overflow_severity(&self, severity: OverflowSeverity) {
        self.lock().overflow_severity = severity;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.lock().name = name.into();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Stop accepting entries and wake every blocked consumer. Queued entries stay poppable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }
}

impl<T: Clone> EventQueue<T> {
    pub fn front(&self) -> Option<T> {
        self.lock().entries.front().cloned()
    }

    pub fn back(&self) -> Option<T> {
        self.lock().entries.back().cloned()
    }
}

impl<T> fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("EventQueue")
            .field("name", &state.name)
            .field("len", &state.entries.len())
            .field("capacity", &self.capacity)
            .field("overflow", &self.overflow)
            .field("closed", &state.closed)
            .field("dropped", &self.dropped())
            .finish()
    }
}
