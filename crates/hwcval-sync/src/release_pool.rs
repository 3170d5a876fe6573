//! Bounded pool of independently signalable release fences.
//!
//! Each slot owns its own timeline, so any slot can be released without implying anything about
//! the others. A producer allocates one release fence per frame; the consumer side later signals
//! slots according to a [`ReleasePolicy`] to check how well the other end copes with buffers being
//! released out of order.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, SyncError};
use crate::fence::{Fence, FenceId};
use crate::timeline::Timeline;

pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_BEFORE_OLDEST: u32 = 3;

/// Order in which pending release fences are signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Oldest allocation first (FIFO).
    Sequential,
    /// A uniformly random pending slot.
    Random,
    /// Release the second-oldest slot `n` times in a row, then the oldest. Requires a full pool.
    RetainOldest(u32),
}

impl ReleasePolicy {
    pub fn name(self) -> &'static str {
        match self {
            ReleasePolicy::Sequential => "sequential",
            ReleasePolicy::Random => "random",
            ReleasePolicy::RetainOldest(_) => "retain-oldest",
        }
    }
}

/// Release policy selector without its parameter, as read from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseMode {
    #[default]
    Sequential,
    Random,
    RetainOldest,
}

impl ReleaseMode {
    pub fn with_before_oldest(self, before_oldest: u32) -> ReleasePolicy {
        match self {
            ReleaseMode::Sequential => ReleasePolicy::Sequential,
            ReleaseMode::Random => ReleasePolicy::Random,
            ReleaseMode::RetainOldest => ReleasePolicy::RetainOldest(before_oldest),
        }
    }
}

impl FromStr for ReleaseMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" | "fifo" => Ok(ReleaseMode::Sequential),
            "random" => Ok(ReleaseMode::Random),
            "retain-oldest" | "retain_oldest" | "oldest" => Ok(ReleaseMode::RetainOldest),
            other => Err(SyncError::InvalidConfig(format!(
                "unknown release mode {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasePoolConfig {
    pub pool_size: usize,
    /// Default `n` for [`ReleasePolicy::RetainOldest`] when driven through [`ReleasePoolConfig::mode`].
    pub before_oldest: u32,
    pub mode: ReleaseMode,
    /// Seed for [`ReleasePolicy::Random`]; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for ReleasePoolConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            before_oldest: DEFAULT_BEFORE_OLDEST,
            mode: ReleaseMode::Sequential,
            seed: None,
        }
    }
}

impl ReleasePoolConfig {
    pub fn policy(&self) -> ReleasePolicy {
        self.mode.with_before_oldest(self.before_oldest)
    }
}

#[derive(Debug)]
struct Slot {
    timeline: Timeline,
    timeline_time: u64,
    pending: Option<FenceId>,
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    /// Occupied slot indices, oldest allocation first.
    age_order: VecDeque<usize>,
    before_oldest_count: u32,
    last_signaled: Option<usize>,
    rng: StdRng,
    shut_down: bool,
}

#[derive(Debug)]
pub struct ReleaseFencePool {
    config: ReleasePoolConfig,
    state: Mutex<PoolState>,
}

impl ReleaseFencePool {
    pub fn new(config: ReleasePoolConfig) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(SyncError::InvalidConfig(
                "release fence pool size must be at least 1".to_string(),
            ));
        }

        let slots = (0..config.pool_size)
            .map(|i| Slot {
                timeline: Timeline::new(&format!("ReleaseFencePool {i}")),
                timeline_time: 0,
                pending: None,
            })
            .collect();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            state: Mutex::new(PoolState {
                slots,
                age_order: VecDeque::with_capacity(config.pool_size),
                before_oldest_count: 0,
                last_signaled: None,
                rng,
                shut_down: false,
            }),
            config,
        })
    }

    pub fn config(&self) -> &ReleasePoolConfig {
        &self.config
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    pub fn before_oldest(&self) -> u32 {
        self.config.before_oldest
    }

    /// Allocate a release fence on the first free slot.
    ///
    /// Returns [`SyncError::Full`] when every slot has a pending fence; the caller should back
    /// off or drop the frame.
    pub fn allocate(&self) -> Result<Fence> {
        let mut state = self.lock();
        if state.shut_down {
            return Err(SyncError::InvalidTimeline {
                name: "ReleaseFencePool".to_string(),
            });
        }

        let Some(index) = state.slots.iter().position(|s| s.pending.is_none()) else {
            return Err(SyncError::Full {
                pool_size: self.config.pool_size,
            });
        };

        let slot = &mut state.slots[index];
        let fence = slot.timeline.create_fence(slot.timeline_time + 1)?;
        slot.pending = Some(fence.id());
        state.age_order.push_back(index);
        tracing::debug!(slot = index, fence = %fence, "release fence allocated");
        Ok(fence)
    }

    /// Signal one pending slot chosen by `policy`. Returns the slot index signaled.
    pub fn signal(&self, policy: ReleasePolicy) -> Result<usize> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.age_order.is_empty() {
            return Err(SyncError::PoolEmpty);
        }

        let index = match policy {
            ReleasePolicy::Sequential => state.age_order[0],
            ReleasePolicy::Random => {
                let occupied = state.age_order.len();
                let pick = state.rng.gen_range(0..occupied);
                state.age_order[pick]
            }
            ReleasePolicy::RetainOldest(before_oldest) => {
                let occupied = state.age_order.len();
                if occupied < self.config.pool_size {
                    let err = SyncError::BadPolicyPrecondition {
                        occupied,
                        pool_size: self.config.pool_size,
                    };
                    tracing::warn!("{err}");
                    return Err(err);
                }
                if state.before_oldest_count >= before_oldest || occupied < 2 {
                    state.before_oldest_count = 0;
                    state.age_order[0]
                } else {
                    state.before_oldest_count += 1;
                    state.age_order[1]
                }
            }
        };

        Self::signal_locked(state, index)?;
        tracing::debug!(slot = index, policy = policy.name(), "release fence signaled");
        Ok(index)
    }

    /// Signal a specific slot.
    pub fn signal_slot(&self, index: usize) -> Result<()> {
        let mut state = self.lock();
        Self::signal_locked(&mut state, index)
    }

    fn signal_locked(state: &mut PoolState, index: usize) -> Result<()> {
        let Some(slot) = state.slots.get_mut(index) else {
            return Err(SyncError::SlotNotPending(index));
        };
        if slot.pending.is_none() {
            return Err(SyncError::SlotNotPending(index));
        }

        slot.timeline.advance(1)?;
        slot.timeline_time += 1;
        slot.pending = None;
        state.last_signaled = Some(index);
        if let Some(pos) = state.age_order.iter().position(|&i| i == index) {
            state.age_order.remove(pos);
        }
        Ok(())
    }

    /// Signal using the policy derived from the pool configuration.
    pub fn signal_configured(&self) -> Result<usize> {
        self.signal(self.config.policy())
    }

    pub fn last_signaled_slot(&self) -> Option<usize> {
        self.lock().last_signaled
    }

    /// Number of slots with a pending fence.
    pub fn occupied(&self) -> usize {
        self.lock().age_order.len()
    }

    pub fn is_full(&self) -> bool {
        self.occupied() == self.config.pool_size
    }

    /// Occupied slots, oldest allocation first.
    pub fn age_order(&self) -> Vec<usize> {
        self.lock().age_order.iter().copied().collect()
    }

    /// Destroy every slot timeline. Outstanding release fences become invalid.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        for slot in &mut state.slots {
            slot.timeline.destroy();
            slot.pending = None;
        }
        state.age_order.clear();
        tracing::debug!(pool_size = self.config.pool_size, "release fence pool shut down");
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ReleaseFencePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn pool(size: usize) -> ReleaseFencePool {
        ReleaseFencePool::new(ReleasePoolConfig {
            pool_size: size,
            seed: Some(0x5eed),
            ..ReleasePoolConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn allocation_beyond_capacity_is_full() {
        let pool = pool(4);
        let fences: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert!(matches!(
            pool.allocate(),
            Err(SyncError::Full { pool_size: 4 })
        ));
        assert_eq!(fences.len(), 4);
        assert!(pool.is_full());
    }

    #[test]
    fn sequential_release_is_fifo() {
        let pool = pool(4);
        let fences: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        for (i, fence) in fences.iter().enumerate() {
            assert!(!fence.is_signaled());
            assert_eq!(pool.signal(ReleasePolicy::Sequential).unwrap(), i);
            assert!(fence.is_signaled());
            assert!(fences[i + 1..].iter().all(|f| !f.is_signaled()));
        }
        assert_eq!(pool.last_signaled_slot(), Some(3));
    }

    #[test]
    fn retain_oldest_releases_second_oldest_then_oldest() {
        let pool = pool(4);
        let mut fences: Vec<_> = (0..4).map(|_| Some(pool.allocate().unwrap())).collect();

        let mut released = Vec::new();
        for _ in 0..4 {
            let slot = pool.signal(ReleasePolicy::RetainOldest(3)).unwrap();
            released.push(slot);
            assert!(fences[slot].take().unwrap().is_signaled());
            fences[slot] = Some(pool.allocate().unwrap());
        }

        // Slot 0 is the oldest allocation throughout; each refill goes to the back.
        assert_eq!(released, vec![1, 2, 3, 0]);
        assert!(!fences[1].as_ref().unwrap().is_signaled());
    }

    #[test]
    fn retain_oldest_needs_a_full_pool() {
        let pool = pool(4);
        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(matches!(
            pool.signal(ReleasePolicy::RetainOldest(3)),
            Err(SyncError::BadPolicyPrecondition {
                occupied: 2,
                pool_size: 4
            })
        ));
        assert_eq!(pool.occupied(), 2, "failed precondition must not release anything");
    }

    #[test]
    fn retain_zero_always_releases_oldest() {
        let pool = pool(3);
        let _fences: Vec<_> = (0..3).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.signal(ReleasePolicy::RetainOldest(0)).unwrap(), 0);
        let _refill = pool.allocate().unwrap();
        assert_eq!(pool.signal(ReleasePolicy::RetainOldest(0)).unwrap(), 1);
    }

    #[test]
    fn single_slot_pool_releases_its_only_fence() {
        let pool = pool(1);
        let fence = pool.allocate().unwrap();
        assert_eq!(pool.signal(ReleasePolicy::RetainOldest(3)).unwrap(), 0);
        assert!(fence.is_signaled());
    }

    #[test]
    fn random_release_only_picks_pending_slots() {
        let pool = pool(4);
        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        pool.signal_slot(0).unwrap();

        assert_eq!(pool.signal(ReleasePolicy::Random).unwrap(), 1);
        assert!(matches!(
            pool.signal(ReleasePolicy::Random),
            Err(SyncError::PoolEmpty)
        ));
    }

    #[test]
    fn empty_pool_signal_fails_harmlessly() {
        let pool = pool(2);
        assert!(matches!(
            pool.signal(ReleasePolicy::Sequential),
            Err(SyncError::PoolEmpty)
        ));
        assert_eq!(pool.last_signaled_slot(), None);
    }

    #[test]
    fn slot_reuse_targets_next_tick() {
        let pool = pool(1);
        let first = pool.allocate().unwrap();
        pool.signal(ReleasePolicy::Sequential).unwrap();
        let second = pool.allocate().unwrap();
        assert!(first.is_signaled());
        assert!(!second.is_signaled());
        assert_eq!(second.sync_points()[0].target, 2);
    }

    #[test]
    fn shutdown_invalidates_outstanding_fences() {
        let pool = pool(2);
        let fence = pool.allocate().unwrap();
        pool.shutdown();
        assert!(!fence.is_signaled());
        assert!(matches!(
            pool.allocate(),
            Err(SyncError::InvalidTimeline { .. })
        ));
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        assert!(matches!(
            ReleaseFencePool::new(ReleasePoolConfig {
                pool_size: 0,
                ..ReleasePoolConfig::default()
            }),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn release_modes_parse() {
        assert_eq!("FIFO".parse::<ReleaseMode>().unwrap(), ReleaseMode::Sequential);
        assert_eq!(
            "retain-oldest".parse::<ReleaseMode>().unwrap(),
            ReleaseMode::RetainOldest
        );
        assert!("sometimes".parse::<ReleaseMode>().is_err());
        assert_eq!(
            ReleaseMode::RetainOldest.with_before_oldest(2),
            ReleasePolicy::RetainOldest(2)
        );
    }
}
