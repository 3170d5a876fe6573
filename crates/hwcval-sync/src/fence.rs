//! Fences: move-only handles to one or more timeline sync points.
//!
//! A fence created by [`Timeline::create_fence`] holds a single `(timeline, target)` point.
//! [`Fence::merge`] AND-composes fences; the result holds at most one point per timeline (the
//! later target wins, since the earlier one is implied by monotonicity).
//!
//! There is no "closed" state to check at runtime: merging consumes its inputs and dropping a
//! fence closes it, so a fence can never be observed after it has been released. Integer
//! fd-style handles with runtime double-close detection live in [`crate::table`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, SyncError};
use crate::timeline::{PointWait, Timeline, TimelineId};

static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique fence identifier, used for diagnostics and pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceId(u64);

impl FenceId {
    fn next() -> Self {
        Self(NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

#[derive(Clone)]
pub(crate) struct SyncPoint {
    timeline: Timeline,
    target: u64,
}

impl SyncPoint {
    pub(crate) fn new(timeline: Timeline, target: u64) -> Self {
        Self { timeline, target }
    }
}

/// Snapshot of one sync point of a fence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPointInfo {
    pub timeline_id: TimelineId,
    pub timeline: Arc<str>,
    pub target: u64,
    pub current: u64,
    pub signaled: bool,
}

/// How a successful wait completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The fence was already signaled; no blocking was needed.
    Immediate,
    /// The caller blocked for the given duration before the fence signaled.
    Waited(Duration),
}

impl WaitOutcome {
    pub fn waited(self) -> Duration {
        match self {
            WaitOutcome::Immediate => Duration::ZERO,
            WaitOutcome::Waited(d) => d,
        }
    }
}

/// A synthetic sync fence.
#[must_use = "dropping a fence closes it"]
pub struct Fence {
    id: FenceId,
    points: Vec<SyncPoint>,
}

impl Fence {
    pub(crate) fn from_point(point: SyncPoint) -> Self {
        Self {
            id: FenceId::next(),
            points: vec![point],
        }
    }

    pub fn id(&self) -> FenceId {
        self.id
    }

    /// AND-compose two optional fences.
    ///
    /// A missing side yields the other side unchanged, which is how a fence is built up
    /// incrementally across several producers. Two present fences are consumed and replaced by a
    /// new fence that signals once both would have.
    pub fn merge(a: Option<Fence>, b: Option<Fence>) -> Option<Fence> {
        match (a, b) {
            (None, other) | (other, None) => other,
            (Some(a), Some(b)) => Some(Self::merged(a, b)),
        }
    }

    fn merged(mut a: Fence, mut b: Fence) -> Fence {
        let mut points = std::mem::take(&mut a.points);
        for point in std::mem::take(&mut b.points) {
            match points
                .iter_mut()
                .find(|p| Timeline::same(&p.timeline, &point.timeline))
            {
                Some(existing) => existing.target = existing.target.max(point.target),
                None => points.push(point),
            }
        }
        let merged = Fence {
            id: FenceId::next(),
            points,
        };
        tracing::trace!(a = %a.id, b = %b.id, merged = %merged.id, fence = %merged, "merged fences");
        merged
    }

    /// Duplicate this fence into an independent handle with the same signal semantics.
    pub fn dup(&self) -> Fence {
        let dup = Fence {
            id: FenceId::next(),
            points: self.points.clone(),
        };
        tracing::trace!(src = %self.id, dup = %dup.id, "duplicated fence");
        dup
    }

    /// Duplicate `src` and combine it into `dest` when `dest` already holds a fence.
    pub fn dup_into(dest: Option<Fence>, src: &Fence) -> Fence {
        match dest {
            None => src.dup(),
            Some(dest) => Self::merged(dest, src.dup()),
        }
    }

    /// Release ownership of the fence.
    pub fn close(self) {
        drop(self);
    }

    /// True once every sync point has been reached on a live timeline.
    pub fn is_signaled(&self) -> bool {
        self.points
            .iter()
            .all(|p| p.timeline.has_reached(p.target))
    }

    /// Block until the fence signals or `timeout` passes.
    ///
    /// The time spent waiting is reported either way so the caller can flag slow releases as
    /// well as missed ones.
    pub fn wait(&self, timeout: Duration) -> Result<WaitOutcome> {
        if self.is_signaled() {
            return Ok(WaitOutcome::Immediate);
        }

        let start = Instant::now();
        // Timeouts too large to represent wait without limit.
        let deadline = start.checked_add(timeout);
        // Timelines never move backwards, so reaching each point in turn is the same as reaching
        // all of them at once.
        for point in &self.points {
            match point.timeline.wait_for(point.target, deadline) {
                PointWait::Reached => {}
                PointWait::Deadline => {
                    let waited = start.elapsed();
                    tracing::debug!(fence = %self, ?waited, ?timeout, "fence wait timed out");
                    return Err(SyncError::Timeout { waited, timeout });
                }
                PointWait::Destroyed => return Err(point.timeline.invalid()),
            }
        }

        let waited = start.elapsed();
        tracing::trace!(fence = %self, ?waited, "fence wait required");
        Ok(WaitOutcome::Waited(waited))
    }

    /// Wait as [`Fence::wait`], then close the fence whatever the outcome.
    pub fn wait_and_close(self, timeout: Duration) -> Result<WaitOutcome> {
        let res = self.wait(timeout);
        self.close();
        res
    }

    pub fn sync_points(&self) -> Vec<SyncPointInfo> {
        self.points
            .iter()
            .map(|p| {
                let current = p.timeline.current();
                SyncPointInfo {
                    timeline_id: p.timeline.id(),
                    timeline: p.timeline.shared_name(),
                    target: p.target,
                    current,
                    signaled: p.timeline.has_reached(p.target),
                }
            })
            .collect()
    }

    /// Emit the per-point status of this fence at trace level.
    pub fn dump(&self, prefix: &str) {
        for info in self.sync_points() {
            tracing::trace!(
                prefix,
                fence = %self.id,
                timeline = %info.timeline,
                target = info.target,
                current = info.current,
                signaled = info.signaled,
                "fence sync point"
            );
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if !self.points.is_empty() {
            tracing::trace!(fence = %self.id, "close fence");
        }
    }
}

impl fmt::Display for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.points.as_slice() {
            [single] => write!(f, "{}:{}", single.timeline.name(), single.target),
            points => {
                f.write_str("[")?;
                for (i, p) in points.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" && ")?;
                    }
                    write!(f, "{}:{}", p.timeline.name(), p.target)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("id", &self.id)
            .field("points", &format_args!("{self}"))
            .finish()
    }
}
