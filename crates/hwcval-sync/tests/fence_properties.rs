use hwcval_sync::{ClosedFenceReconciler, Fence, Timeline};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    Advance(u64),
    AdvanceTo(u64),
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        prop_oneof![
            (0u64..8).prop_map(Step::Advance),
            (0u64..64).prop_map(Step::AdvanceTo),
        ],
        0..48,
    )
}

#[derive(Debug, Clone, Copy)]
enum ReconcilerOp {
    Create,
    Close,
    Reconcile,
}

fn reconciler_ops() -> impl Strategy<Value = Vec<ReconcilerOp>> {
    prop::collection::vec(
        prop_oneof![
            Just(ReconcilerOp::Create),
            Just(ReconcilerOp::Close),
            Just(ReconcilerOp::Reconcile),
        ],
        0..96,
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        rng_algorithm: proptest::test_runner::RngAlgorithm::ChaCha,
        rng_seed: proptest::test_runner::RngSeed::Fixed(0x5F_E4_CE),
        .. ProptestConfig::default()
    })]

    #[test]
    fn current_sequence_is_monotonic(steps in steps()) {
        let timeline = Timeline::new("prop");
        let mut last = timeline.current();
        for step in steps {
            let now = match step {
                Step::Advance(ticks) => timeline.advance(ticks).unwrap(),
                Step::AdvanceTo(abs) => timeline.advance_to(abs).unwrap(),
            };
            prop_assert!(now >= last, "moved backwards from {} to {}", last, now);
            prop_assert_eq!(now, timeline.current());
            last = now;
        }
    }

    #[test]
    fn fence_signals_iff_target_reached(target in 0u64..48, steps in steps()) {
        let timeline = Timeline::new("prop");
        let fence = timeline.create_fence(target).unwrap();
        prop_assert_eq!(fence.is_signaled(), timeline.current() >= target);
        for step in steps {
            match step {
                Step::Advance(ticks) => { timeline.advance(ticks).unwrap(); }
                Step::AdvanceTo(abs) => { timeline.advance_to(abs).unwrap(); }
            }
            prop_assert_eq!(fence.is_signaled(), timeline.current() >= target);
        }
    }

    #[test]
    fn merge_is_and(
        ta in 0u64..16,
        tb in 0u64..16,
        shared in any::<bool>(),
        advances in prop::collection::vec((any::<bool>(), 0u64..4), 0..16),
    ) {
        let a = Timeline::new("a");
        let b = if shared { a.clone() } else { Timeline::new("b") };

        // Reference fences are dup'd before the merge consumes the originals.
        let fa = a.create_fence(ta).unwrap();
        let fb = b.create_fence(tb).unwrap();
        let ref_a = fa.dup();
        let ref_b = fb.dup();
        let merged = Fence::merge(Some(fa), Some(fb)).unwrap();

        prop_assert_eq!(merged.is_signaled(), ref_a.is_signaled() && ref_b.is_signaled());
        for (on_a, ticks) in advances {
            let t = if on_a { &a } else { &b };
            t.advance(ticks).unwrap();
            prop_assert_eq!(merged.is_signaled(), ref_a.is_signaled() && ref_b.is_signaled());
        }
    }

    #[test]
    fn reconciler_counters_stay_ordered(ops in reconciler_ops()) {
        let rec = ClosedFenceReconciler::new(7);
        let mut open = 0u64;
        let mut fences = Vec::new();
        for op in ops {
            match op {
                ReconcilerOp::Create => {
                    fences.push(rec.create_shim_fence(&open).unwrap());
                    open += 1;
                }
                // Caller contract: only close what was created.
                ReconcilerOp::Close if open > 0 => {
                    rec.report_closed(open);
                    open -= 1;
                }
                ReconcilerOp::Close => {}
                ReconcilerOp::Reconcile => {
                    let before = rec.timeline().current();
                    let applied = rec.reconcile().unwrap();
                    prop_assert_eq!(rec.timeline().current(), before + applied);
                }
            }
            let c = rec.counters();
            prop_assert!(c.current_seq <= c.closed_count);
            prop_assert!(c.closed_count <= c.timeline_seq);
            prop_assert_eq!(rec.timeline().current(), c.current_seq);
        }

        rec.reconcile().unwrap();
        let closed = rec.counters().closed_count as usize;
        for (i, fence) in fences.iter().enumerate() {
            prop_assert_eq!(fence.is_signaled(), i < closed);
        }
    }
}
