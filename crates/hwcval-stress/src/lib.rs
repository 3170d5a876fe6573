//! End-to-end release-fence stress scenario.
//!
//! A producer renders frames onto an acquire timeline and takes one release fence per frame from
//! a [`ReleaseFencePool`]. Consumer workers wait for each frame's acquire fence, report it closed to
//! a [`ClosedFenceReconciler`], and release one pool slot according to the configured
//! [`ReleasePolicy`]. The producer backs off while the pool is full, so out-of-order release
//! policies directly shape how it makes progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use hwcval_dispatch::{Dispatcher, DispatcherConfig, OverflowPolicy, QueueError};
use hwcval_sync::{
    ClosedFenceReconciler, Fence, ReleaseFencePool, ReleasePolicy, SyncConfig, SyncError,
    Timeline, TimelineTicker, WaitOutcome,
};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioConfig {
    pub frames: u64,
    pub workers: usize,
    pub sync: SyncConfig,
    /// Drive acquire fences from a free-running vsync timeline instead of the producer.
    pub vsync: bool,
    /// Sleep between allocation retries while the release pool is full.
    pub back_off: Duration,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            frames: 120,
            workers: 1,
            sync: SyncConfig::default(),
            vsync: false,
            back_off: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioReport {
    pub policy: String,
    pub pool_size: usize,
    pub workers: usize,
    pub frames: u64,
    pub handled: u64,
    /// Acquire fences already signaled when the consumer got to them.
    pub immediate_waits: u64,
    /// Acquire fences the consumer had to block on.
    pub blocked_waits: u64,
    /// Acquire and release waits that hit the fence timeout.
    pub timeouts: u64,
    pub pool_full_backoffs: u64,
    /// Policy signals attempted on a pool that was not full; each fell back to sequential.
    pub precondition_failures: u64,
    pub errors: u64,
    pub shim_fences_signaled: u64,
    pub reconciled: u64,
    /// Pool slot released for each handled frame, in release order.
    pub signal_order: Vec<usize>,
}

impl ScenarioReport {
    pub fn is_clean(&self) -> bool {
        self.timeouts == 0
            && self.errors == 0
            && self.handled == self.frames
            && self.shim_fences_signaled == self.frames
    }
}

struct Frame {
    seq: u64,
    acquire: Fence,
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    handled: AtomicU64,
    immediate: AtomicU64,
    blocked: AtomicU64,
    timeouts: AtomicU64,
    precondition_failures: AtomicU64,
    errors: AtomicU64,
}

struct Consumer {
    pool: Arc<ReleaseFencePool>,
    reconciler: Arc<ClosedFenceReconciler>,
    policy: ReleasePolicy,
    timeout: Duration,
    counters: ConsumerCounters,
    signal_order: Mutex<Vec<usize>>,
}

impl Consumer {
    fn handle(&self, frame: Frame) {
        let c = &self.counters;
        match frame.acquire.wait_and_close(self.timeout) {
            Ok(WaitOutcome::Immediate) => {
                c.immediate.fetch_add(1, Ordering::Relaxed);
            }
            Ok(WaitOutcome::Waited(waited)) => {
                tracing::trace!(frame = frame.seq, ?waited, "acquire fence waited");
                c.blocked.fetch_add(1, Ordering::Relaxed);
            }
            Err(err @ SyncError::Timeout { .. }) => {
                tracing::warn!(frame = frame.seq, "{err}");
                c.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::warn!(frame = frame.seq, "acquire wait failed: {err}");
                c.errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.reconciler.report_closed(frame.seq);
        if let Err(err) = self.reconciler.reconcile() {
            tracing::warn!(frame = frame.seq, "reconcile failed: {err}");
            c.errors.fetch_add(1, Ordering::Relaxed);
        }

        self.release_one();
        c.handled.fetch_add(1, Ordering::Relaxed);
    }

    fn release_one(&self) {
        // Held across the signal so the recorded order is the real release order.
        let mut order = self
            .signal_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let signaled = match self.pool.signal(self.policy) {
            Err(SyncError::BadPolicyPrecondition { .. }) => {
                self.counters
                    .precondition_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.pool.signal(ReleasePolicy::Sequential)
            }
            other => other,
        };
        match signaled {
            Ok(slot) => order.push(slot),
            Err(err) => {
                tracing::warn!("release signal failed: {err}");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Run the scenario to completion. Fence timeouts and handler failures are counted in the
/// report; only setup failures and a stalled producer are returned as errors.
pub fn run_scenario(config: &ScenarioConfig) -> Result<ScenarioReport> {
    let sync = &config.sync;
    let policy = sync.release_policy();
    let pool = Arc::new(
        ReleaseFencePool::new(sync.pool_config()).context("creating release fence pool")?,
    );
    let reconciler = Arc::new(ClosedFenceReconciler::new(0));
    let render = Timeline::new("render");
    let mut ticker = if config.vsync {
        Some(
            TimelineTicker::spawn(render.clone(), sync.tick_period)
                .context("spawning vsync ticker")?,
        )
    } else {
        None
    };

    let consumer = Arc::new(Consumer {
        pool: pool.clone(),
        reconciler: reconciler.clone(),
        policy,
        timeout: sync.fence_timeout,
        counters: ConsumerCounters::default(),
        signal_order: Mutex::new(Vec::new()),
    });
    let handler = {
        let consumer = consumer.clone();
        move |frame: Frame| consumer.handle(frame)
    };
    // Every queued frame holds a pending pool slot, so a queue as deep as the pool never fills.
    let mut dispatcher = Dispatcher::spawn(
        "hwcval consumer",
        DispatcherConfig {
            capacity: pool.pool_size(),
            workers: config.workers,
            overflow: OverflowPolicy::Reject,
        },
        Arc::new(handler),
    )
    .context("spawning consumer workers")?;

    tracing::info!(
        frames = config.frames,
        pool_size = pool.pool_size(),
        policy = policy.name(),
        workers = dispatcher.worker_count(),
        vsync = config.vsync,
        "starting release fence scenario"
    );

    let mut held = Vec::new();
    let mut shims = Vec::new();
    let mut backoffs = 0;
    for seq in 0..config.frames {
        let release = allocate_release(&pool, &mut held, config, &mut backoffs)?;
        held.push(release);
        shims.push(reconciler.create_shim_fence(&seq)?);

        let acquire = render.create_future_fence(None)?;
        render.advance_future_time(1)?;
        match dispatcher.push(Frame { seq, acquire }) {
            Ok(_) => {}
            Err(QueueError::Full(_)) => bail!("consumer queue overflowed at frame {seq}"),
            Err(QueueError::Closed(_)) => bail!("consumer queue closed at frame {seq}"),
        }
        if ticker.is_none() {
            render.advance(1)?;
        }
    }

    dispatcher.stop();
    if let Some(ticker) = ticker.as_mut() {
        ticker.stop();
    }

    let mut release_timeouts = 0;
    for fence in held {
        if let Err(err) = fence.wait_and_close(sync.fence_timeout) {
            tracing::warn!("release fence never signaled: {err}");
            release_timeouts += 1;
        }
    }

    reconciler.reconcile()?;
    let shim_fences_signaled = shims.iter().filter(|f| f.is_signaled()).count() as u64;

    let c = &consumer.counters;
    let signal_order = consumer
        .signal_order
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let report = ScenarioReport {
        policy: policy.name().to_string(),
        pool_size: pool.pool_size(),
        workers: dispatcher.worker_count(),
        frames: config.frames,
        handled: c.handled.load(Ordering::Relaxed),
        immediate_waits: c.immediate.load(Ordering::Relaxed),
        blocked_waits: c.blocked.load(Ordering::Relaxed),
        timeouts: c.timeouts.load(Ordering::Relaxed) + release_timeouts,
        pool_full_backoffs: backoffs,
        precondition_failures: c.precondition_failures.load(Ordering::Relaxed),
        errors: c.errors.load(Ordering::Relaxed),
        shim_fences_signaled,
        reconciled: reconciler.counters().current_seq,
        signal_order,
    };
    tracing::info!(
        handled = report.handled,
        timeouts = report.timeouts,
        backoffs = report.pool_full_backoffs,
        precondition_failures = report.precondition_failures,
        "scenario finished"
    );
    Ok(report)
}

fn allocate_release(
    pool: &ReleaseFencePool,
    held: &mut Vec<Fence>,
    config: &ScenarioConfig,
    backoffs: &mut u64,
) -> Result<Fence> {
    let start = Instant::now();
    loop {
        match pool.allocate() {
            Ok(fence) => return Ok(fence),
            Err(SyncError::Full { pool_size }) => {
                *backoffs += 1;
                // Dropping a signaled release fence closes it.
                held.retain(|f| !f.is_signaled());
                if start.elapsed() >= config.sync.fence_timeout {
                    bail!(
                        "release fence pool ({pool_size} slots) stayed full for {:?}",
                        config.sync.fence_timeout
                    );
                }
                thread::sleep(config.back_off);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_frames_is_a_clean_noop() {
        let report = run_scenario(&ScenarioConfig {
            frames: 0,
            ..ScenarioConfig::default()
        })
        .unwrap();
        assert!(report.is_clean());
        assert!(report.signal_order.is_empty());
        assert_eq!(report.policy, "sequential");
    }
}
