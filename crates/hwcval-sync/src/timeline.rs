//! Software sync timelines.
//!
//! A [`Timeline`] is a monotonically increasing counter. Fences are created against a target
//! value on a timeline and become signaled once the counter reaches that target. Signaled state
//! is never pushed to fences; it is computed when a fence is queried or waited on.
//!
//! All writers of a timeline's counter go through one mutex, so advances on a given timeline are
//! totally ordered even when several threads signal it. Blocked waiters are woken through a
//! condition variable whenever the counter moves or the timeline is destroyed.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::error::{Result, SyncError};
use crate::fence::{Fence, SyncPoint};

static NEXT_TIMELINE_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique timeline identifier, used for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimelineId(u32);

impl TimelineId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

#[derive(Debug)]
struct TimelineState {
    current: u64,
    next_future: u64,
    destroyed: bool,
}

#[derive(Debug)]
struct Shared {
    id: TimelineId,
    name: Arc<str>,
    state: Mutex<TimelineState>,
    advanced: Condvar,
}

/// Outcome of blocking on a single sync point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PointWait {
    Reached,
    Deadline,
    Destroyed,
}

/// Cloneable handle to a shared software timeline.
///
/// Clones refer to the same counter. Fences hold a clone so they can observe the counter after
/// the creator has moved on.
#[derive(Clone)]
pub struct Timeline {
    shared: Arc<Shared>,
}

impl Timeline {
    /// Create a timeline at sequence 0 whose first future fence targets sequence 1.
    pub fn new(name: &str) -> Self {
        Self::with_first_future_time(name, 1)
    }

    /// Create a timeline whose [`Timeline::create_future_fence`] starts at `first_future_time`.
    ///
    /// Larger values widen the initial gap between fence creation and release.
    pub fn with_first_future_time(name: &str, first_future_time: u64) -> Self {
        if first_future_time == 0 {
            tracing::warn!(timeline = name, "expected non-zero first future time");
        }
        let name = if name.is_empty() { "NO-NAME" } else { name };
        let id = TimelineId(NEXT_TIMELINE_ID.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(%id, timeline = name, "timeline created");
        Self {
            shared: Arc::new(Shared {
                id,
                name: Arc::from(name),
                state: Mutex::new(TimelineState {
                    current: 0,
                    next_future: first_future_time,
                    destroyed: false,
                }),
                advanced: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> TimelineId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.shared.name.clone()
    }

    /// Current sequence value.
    pub fn current(&self) -> u64 {
        self.lock().current
    }

    /// Sequence targeted by the next [`Timeline::create_future_fence`].
    pub fn future_time(&self) -> u64 {
        self.lock().next_future
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Returns true if `a` and `b` refer to the same underlying timeline.
    pub fn same(a: &Timeline, b: &Timeline) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }

    /// Create a simple fence that signals once the timeline reaches `target`.
    pub fn create_fence(&self, target: u64) -> Result<Fence> {
        let state = self.lock();
        if state.destroyed {
            return Err(self.invalid());
        }
        drop(state);
        let fence = Fence::from_point(SyncPoint::new(self.clone(), target));
        tracing::trace!(timeline = %self.name(), target, fence = %fence.id(), "created fence");
        Ok(fence)
    }

    /// Create a fence at the future time and combine it with `existing`, if any.
    ///
    /// The returned fence represents completion of both. The future time itself only moves via
    /// [`Timeline::advance_future_time`].
    pub fn create_future_fence(&self, existing: Option<Fence>) -> Result<Fence> {
        let target = {
            let state = self.lock();
            if state.destroyed {
                return Err(self.invalid());
            }
            state.next_future
        };
        let created = self.create_fence(target)?;
        match Fence::merge(existing, Some(created)) {
            Some(fence) => Ok(fence),
            None => Err(SyncError::AllocationFailed(format!(
                "merge into future fence on {} produced no fence",
                self.name()
            ))),
        }
    }

    /// Push the future time forward by `delta` ticks.
    pub fn advance_future_time(&self, delta: u64) -> Result<u64> {
        let mut state = self.lock();
        if state.destroyed {
            return Err(self.invalid());
        }
        state.next_future = state.next_future.saturating_add(delta);
        tracing::debug!(timeline = %self.name(), next_future = state.next_future, "future time advanced");
        Ok(state.next_future)
    }

    /// Advance the current sequence by `ticks`, signaling every fence whose target is reached.
    ///
    /// Returns the new current sequence.
    pub fn advance(&self, ticks: u64) -> Result<u64> {
        let mut state = self.lock();
        if state.destroyed {
            tracing::warn!(timeline = %self.name(), "advance on a destroyed timeline");
            return Err(self.invalid());
        }
        state.current = state.current.saturating_add(ticks);
        let current = state.current;
        drop(state);

        self.shared.advanced.notify_all();
        tracing::debug!(timeline = %self.name(), ticks, current, "timeline advanced");
        Ok(current)
    }

    /// Advance the current sequence to `absolute`.
    ///
    /// Asking for a value at or behind the current sequence is a caller error: it is logged and
    /// the timeline is left where it is. Returns the resulting current sequence.
    pub fn advance_to(&self, absolute: u64) -> Result<u64> {
        let mut state = self.lock();
        if state.destroyed {
            tracing::warn!(timeline = %self.name(), "advance_to on a destroyed timeline");
            return Err(self.invalid());
        }
        if absolute <= state.current {
            tracing::warn!(
                timeline = %self.name(),
                absolute,
                current = state.current,
                "advance timeline delta is not positive"
            );
            return Ok(state.current);
        }

        // Same critical section as the check so a concurrent advance cannot overshoot us.
        state.current = absolute;
        drop(state);

        self.shared.advanced.notify_all();
        tracing::debug!(timeline = %self.name(), current = absolute, "timeline advanced to");
        Ok(absolute)
    }

    /// Tear the timeline down. Outstanding fences become permanently unsignaled and blocked
    /// waiters return with [`SyncError::InvalidTimeline`].
    pub fn destroy(&self) {
        let mut state = self.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        drop(state);

        self.shared.advanced.notify_all();
        tracing::debug!(timeline = %self.name(), "timeline destroyed");
    }

    /// Lazily computed signaled state for a fence targeting `target`.
    pub(crate) fn has_reached(&self, target: u64) -> bool {
        let state = self.lock();
        !state.destroyed && state.current >= target
    }

    /// Block until the timeline reaches `target`, the deadline passes or the timeline dies.
    ///
    /// A `None` deadline waits without limit.
    pub(crate) fn wait_for(&self, target: u64, deadline: Option<Instant>) -> PointWait {
        let mut state = self.lock();
        loop {
            if state.destroyed {
                return PointWait::Destroyed;
            }
            if state.current >= target {
                return PointWait::Reached;
            }
            state = match deadline {
                None => self
                    .shared
                    .advanced
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return PointWait::Deadline;
                    }
                    self.shared
                        .advanced
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    pub(crate) fn invalid(&self) -> SyncError {
        SyncError::InvalidTimeline {
            name: self.name().to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimelineState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Timeline")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("current", &state.current)
            .field("next_future", &state.next_future)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}
