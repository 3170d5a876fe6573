use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hwcval_sync::{
    Fence, FenceHandle, FenceTable, ReleaseFencePool, ReleaseMode, ReleasePolicy,
    ReleasePoolConfig, SyncError, Timeline, WaitOutcome,
};
use pretty_assertions::assert_eq;

#[test]
fn advance_and_advance_to_scenario() {
    let t = Timeline::new("T");
    let f3 = t.create_fence(3).unwrap();
    let f5 = t.create_fence(5).unwrap();

    assert_eq!(t.advance(2).unwrap(), 2);
    assert!(!f3.is_signaled());
    assert!(!f5.is_signaled());

    assert_eq!(t.advance_to(4).unwrap(), 4);
    assert!(f3.is_signaled());
    assert!(!f5.is_signaled());

    // Backwards target is ignored.
    assert_eq!(t.advance_to(3).unwrap(), 4);
    assert_eq!(t.current(), 4);
    assert!(!f5.is_signaled());
}

#[test]
fn merge_with_none_is_identity() {
    let t = Timeline::new("T");
    let fence = t.create_fence(2).unwrap();
    let id = fence.id();

    let merged = Fence::merge(Some(fence), None).unwrap();
    assert_eq!(merged.id(), id);
    let merged = Fence::merge(None, Some(merged)).unwrap();
    assert_eq!(merged.id(), id);
    assert!(Fence::merge(None, None).is_none());
}

#[test]
fn pool_capacity_and_sequential_fifo() {
    let pool = ReleaseFencePool::new(ReleasePoolConfig {
        pool_size: 4,
        ..ReleasePoolConfig::default()
    })
    .unwrap();

    let fences: Vec<Fence> = (0..4).map(|_| pool.allocate().unwrap()).collect();
    assert!(pool.is_full());
    assert!(matches!(
        pool.allocate(),
        Err(SyncError::Full { pool_size: 4 })
    ));

    let mut order = Vec::new();
    for _ in 0..4 {
        order.push(pool.signal(ReleasePolicy::Sequential).unwrap());
    }
    assert_eq!(order, vec![0, 1, 2, 3]);
    assert!(fences.iter().all(Fence::is_signaled));
    assert!(matches!(
        pool.signal(ReleasePolicy::Sequential),
        Err(SyncError::PoolEmpty)
    ));
}

#[test]
fn random_release_is_reproducible_with_seed() {
    let run = || {
        let pool = ReleaseFencePool::new(ReleasePoolConfig {
            pool_size: 6,
            mode: ReleaseMode::Random,
            seed: Some(42),
            ..ReleasePoolConfig::default()
        })
        .unwrap();
        let _fences: Vec<Fence> = (0..6).map(|_| pool.allocate().unwrap()).collect();
        (0..6)
            .map(|_| pool.signal_configured().unwrap())
            .collect::<Vec<_>>()
    };

    let first = run();
    let mut sorted = first.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(run(), first);
}

#[test]
fn consumer_thread_waits_for_producer_release() {
    let pool = Arc::new(
        ReleaseFencePool::new(ReleasePoolConfig {
            pool_size: 2,
            ..ReleasePoolConfig::default()
        })
        .unwrap(),
    );
    let fence = pool.allocate().unwrap();

    let signaler = {
        let pool = pool.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            pool.signal(ReleasePolicy::Sequential).unwrap()
        })
    };

    let outcome = fence.wait_and_close(Duration::from_secs(10)).unwrap();
    assert!(matches!(outcome, WaitOutcome::Waited(_)));
    assert_eq!(signaler.join().unwrap(), 0);
    assert_eq!(pool.last_signaled_slot(), Some(0));
}

#[test]
fn shutdown_invalidates_outstanding_fences() {
    let pool = ReleaseFencePool::new(ReleasePoolConfig::default()).unwrap();
    let fence = pool.allocate().unwrap();
    pool.shutdown();

    assert!(!fence.is_signaled());
    assert!(matches!(
        fence.wait(Duration::from_millis(10)),
        Err(SyncError::InvalidTimeline { .. })
    ));
    assert!(matches!(
        pool.allocate(),
        Err(SyncError::InvalidTimeline { .. })
    ));
}

#[test]
fn handles_round_trip_through_raw_integers() {
    let table = FenceTable::new();
    let t = Timeline::new("T");

    let a = table.insert(t.create_fence(1).unwrap()).unwrap();
    let b = table.insert(t.create_fence(2).unwrap()).unwrap();
    let raw = FenceHandle::into_raw(table.merge(Some(a), Some(b)).unwrap());
    assert!(raw > 0);

    let merged = FenceHandle::from_raw(raw).unwrap();
    assert_eq!(FenceHandle::from_raw(-1), None);
    assert_eq!(FenceHandle::from_raw(0), None);

    t.advance(1).unwrap();
    assert!(!table.is_signaled(merged).unwrap());
    t.advance(1).unwrap();
    assert!(table.is_signaled(merged).unwrap());

    table.wait_and_close(merged, Duration::from_millis(10)).unwrap();
    assert!(matches!(
        table.close(merged),
        Err(SyncError::DoubleClose(h)) if h == merged
    ));
    assert_eq!(table.stats().double_closed, 1);
}
