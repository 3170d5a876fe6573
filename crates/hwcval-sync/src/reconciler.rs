//! Closed-fence reconciliation.
//!
//! The shim hands out one output fence per input fence it intercepts, but learns that input
//! fences completed on whichever thread happens to close them, and not necessarily in creation
//! order. [`ClosedFenceReconciler`] decouples the two rates: creation takes a ticket on an
//! internally owned timeline, closure only bumps a counter, and [`ClosedFenceReconciler::reconcile`]
//! later advances the timeline by however many closures were seen since the last call.
//!
//! Counter invariant (under the caller contract below):
//! `current_seq <= closed_count <= timeline_seq`.
//!
//! Caller contract: report exactly one closure per shim fence created. The reconciler does not
//! remember which input maps to which ticket, so memory stays bounded in long sessions; a
//! mismatched caller is only diagnosed in logs.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicU64;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicU64;

use std::fmt::Debug;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, PoisonError};

use crate::error::Result;
use crate::fence::Fence;
use crate::timeline::Timeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerCounters {
    pub timeline_seq: u64,
    pub current_seq: u64,
    pub closed_count: u64,
}

#[derive(Debug)]
pub struct ClosedFenceReconciler {
    timeline: Timeline,
    /// Ticket handed to the most recently created shim fence.
    timeline_seq: AtomicU64,
    /// Input fences reported closed so far.
    closed_count: AtomicU64,
    /// Last sequence actually applied to `timeline`. The mutex also serializes `reconcile`.
    current_seq: Mutex<u64>,
}

impl ClosedFenceReconciler {
    pub fn new(id: u32) -> Self {
        Self::with_timeline(Timeline::new(&format!("HwcTestTimeline {id}")))
    }

    /// Reconcile onto an existing timeline. The reconciler takes over advancing it and destroys
    /// it on drop.
    pub fn with_timeline(timeline: Timeline) -> Self {
        Self {
            timeline,
            timeline_seq: AtomicU64::new(0),
            closed_count: AtomicU64::new(0),
            current_seq: Mutex::new(0),
        }
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Create the output fence standing in for `input`, on the next timeline ticket.
    pub fn create_shim_fence<R: Debug>(&self, input: &R) -> Result<Fence> {
        let seq = self.timeline_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let fence = match self.timeline.create_fence(seq) {
            Ok(fence) => fence,
            Err(err) => {
                // No fence was handed out, so nobody will ever report this ticket closed.
                self.timeline_seq.fetch_sub(1, Ordering::AcqRel);
                return Err(err);
            }
        };
        tracing::debug!(
            timeline = %self.timeline.name(),
            ?input,
            seq,
            out_fence = %fence.id(),
            "create shim fence"
        );
        Ok(fence)
    }

    /// Record that an input fence completed. The input reference is consumed, which closes it
    /// when it is itself a [`Fence`].
    pub fn report_closed<R: Debug>(&self, input: R) {
        let closed = self.closed_count.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(timeline = %self.timeline.name(), ?input, closed, "closed in fence");
        if closed > self.timeline_seq.load(Ordering::Acquire) {
            tracing::debug!(
                timeline = %self.timeline.name(),
                closed,
                "more input fences closed than shim fences created"
            );
        }
        drop(input);
    }

    /// Advance the output timeline up to the number of closed input fences.
    ///
    /// Returns the number of ticks applied; zero is the steady state when nothing new closed.
    pub fn reconcile(&self) -> Result<u64> {
        let mut current_seq = self
            .current_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let closed = self.closed_count.load(Ordering::Acquire);

        let Some(increment) = closed.checked_sub(*current_seq).filter(|&d| d > 0) else {
            tracing::trace!(timeline = %self.timeline.name(), "no increment");
            return Ok(0);
        };

        self.timeline.advance(increment)?;
        *current_seq = closed;
        tracing::debug!(timeline = %self.timeline.name(), increment, "increment");
        Ok(increment)
    }

    pub fn counters(&self) -> ReconcilerCounters {
        // Read the applied sequence first: the other two only grow, so the snapshot still
        // satisfies the invariant.
        let current_seq = *self
            .current_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let closed_count = self.closed_count.load(Ordering::Acquire);
        let timeline_seq = self.timeline_seq.load(Ordering::Acquire);
        ReconcilerCounters {
            timeline_seq,
            current_seq,
            closed_count,
        }
    }
}

impl Drop for ClosedFenceReconciler {
    fn drop(&mut self) {
        tracing::debug!(timeline = %self.timeline.name(), "reconciler shut down");
        self.timeline.destroy();
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reconcile_signals_up_to_closed_count() {
        let rec = ClosedFenceReconciler::new(0);
        let f1 = rec.create_shim_fence(&"in1").unwrap();
        let f2 = rec.create_shim_fence(&"in2").unwrap();
        let f3 = rec.create_shim_fence(&"in3").unwrap();

        rec.report_closed("in2");
        rec.report_closed("in1");
        assert!(!f1.is_signaled(), "closure alone must not signal");

        assert_eq!(rec.reconcile().unwrap(), 2);
        assert!(f1.is_signaled());
        assert!(f2.is_signaled());
        assert!(!f3.is_signaled());

        assert_eq!(rec.reconcile().unwrap(), 0);
        assert_eq!(
            rec.counters(),
            ReconcilerCounters {
                timeline_seq: 3,
                current_seq: 2,
                closed_count: 2,
            }
        );
    }

    #[test]
    fn report_closed_closes_input_fence() {
        let input_timeline = Timeline::new("input");
        let rec = ClosedFenceReconciler::new(1);
        let input = input_timeline.create_fence(1).unwrap();
        let shim = rec.create_shim_fence(&input.id()).unwrap();
        rec.report_closed(input);
        rec.reconcile().unwrap();
        assert!(shim.is_signaled());
    }

    #[test]
    fn concurrent_closures_are_all_counted() {
        let rec = Arc::new(ClosedFenceReconciler::new(2));
        let fences: Vec<_> = (0..400)
            .map(|i| rec.create_shim_fence(&i).unwrap())
            .collect();

        let workers: Vec<_> = (0..4)
            .map(|w| {
                let rec = rec.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        rec.report_closed((w, i));
                        if i % 7 == 0 {
                            rec.reconcile().unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        rec.reconcile().unwrap();

        assert!(fences.iter().all(Fence::is_signaled));
        assert_eq!(rec.timeline().current(), 400);
    }

    #[test]
    fn failed_shim_creation_takes_no_ticket() {
        let timeline = Timeline::new("external");
        let rec = ClosedFenceReconciler::with_timeline(timeline.clone());
        let _first = rec.create_shim_fence(&"in1").unwrap();

        timeline.destroy();
        assert!(matches!(
            rec.create_shim_fence(&"in2"),
            Err(crate::error::SyncError::InvalidTimeline { .. })
        ));
        assert_eq!(rec.counters().timeline_seq, 1);
    }

    #[test]
    fn drop_destroys_output_timeline() {
        let rec = ClosedFenceReconciler::new(3);
        let timeline = rec.timeline().clone();
        drop(rec);
        assert!(timeline.is_destroyed());
    }
}

#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;

    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn reconcile_never_overshoots_closed_count() {
        loom::model(|| {
            let rec = Arc::new(ClosedFenceReconciler::new(0));
            let _a = rec.create_shim_fence(&0).unwrap();
            let _b = rec.create_shim_fence(&1).unwrap();

            let closer = {
                let rec = rec.clone();
                thread::spawn(move || {
                    rec.report_closed(0);
                    rec.report_closed(1);
                })
            };

            rec.reconcile().unwrap();
            let mid = rec.counters();
            assert!(mid.current_seq <= mid.closed_count);
            assert!(mid.closed_count <= mid.timeline_seq);

            closer.join().unwrap();
            rec.reconcile().unwrap();
            assert_eq!(rec.timeline().current(), 2);
        });
    }
}
