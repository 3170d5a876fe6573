//! Integer fence handles for harness code that passes fences around like file descriptors.
//!
//! [`FenceTable`] owns [`Fence`]s and hands out [`FenceHandle`]s. Raw values `<= 0` mean "no
//! fence", matching the fd convention, but inside Rust the absence of a fence is always
//! `Option<FenceHandle>`. Handles are never reused, so a handle that was issued and is no
//! longer in the table has been closed or merged away; using it again is reported as
//! [`SyncError::DoubleClose`] rather than silently acting on some other fence.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::fence::{Fence, WaitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceHandle(NonZeroU32);

impl FenceHandle {
    /// Interpret an fd-style integer; zero and negative values mean "no fence".
    pub fn from_raw(raw: i64) -> Option<Self> {
        u32::try_from(raw).ok().and_then(NonZeroU32::new).map(Self)
    }

    /// Inverse of [`FenceHandle::from_raw`]: `None` becomes `-1`.
    pub fn into_raw(handle: Option<Self>) -> i64 {
        match handle {
            Some(h) => i64::from(h.0.get()),
            None => -1,
        }
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for FenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceTableStats {
    pub live: usize,
    pub closed: u64,
    pub double_closed: u64,
}

#[derive(Debug)]
struct Inner {
    fences: HashMap<FenceHandle, Fence>,
    next: u32,
    closed: u64,
}

#[derive(Debug)]
pub struct FenceTable {
    inner: Mutex<Inner>,
    double_closed: AtomicU64,
}

impl Default for FenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                fences: HashMap::new(),
                next: 1,
                closed: 0,
            }),
            double_closed: AtomicU64::new(0),
        }
    }

    /// Take ownership of `fence` and return its handle.
    pub fn insert(&self, fence: Fence) -> Result<FenceHandle> {
        let mut inner = self.lock();
        Self::insert_locked(&mut inner, fence)
    }

    fn insert_locked(inner: &mut Inner, fence: Fence) -> Result<FenceHandle> {
        let Some(raw) = NonZeroU32::new(inner.next) else {
            return Err(SyncError::AllocationFailed(
                "fence handle space exhausted".to_string(),
            ));
        };
        let handle = FenceHandle(raw);
        inner.next = inner.next.checked_add(1).unwrap_or(0);
        tracing::trace!(%handle, fence = %fence, "fence handle issued");
        inner.fences.insert(handle, fence);
        Ok(handle)
    }

    /// Insert an optional fence, mapping `None` to `None`.
    pub fn insert_opt(&self, fence: Option<Fence>) -> Result<Option<FenceHandle>> {
        fence.map(|f| self.insert(f)).transpose()
    }

    /// Remove the fence from the table and hand ownership back to the caller.
    pub fn take(&self, handle: FenceHandle) -> Result<Fence> {
        let mut inner = self.lock();
        Self::take_locked(&mut inner, handle)
    }

    fn take_locked(inner: &mut Inner, handle: FenceHandle) -> Result<Fence> {
        match inner.fences.remove(&handle) {
            Some(fence) => Ok(fence),
            None => Err(Self::missing(inner, handle)),
        }
    }

    fn missing(inner: &Inner, handle: FenceHandle) -> SyncError {
        if handle.get() < inner.next || inner.next == 0 {
            SyncError::DoubleClose(handle)
        } else {
            SyncError::UnknownFence(handle)
        }
    }

    /// Close a handle.
    ///
    /// Closing a handle twice is a caller bug: it is logged and counted, the table is left
    /// untouched, and the error is returned for the harness to record.
    pub fn close(&self, handle: FenceHandle) -> Result<()> {
        let mut inner = self.lock();
        match Self::take_locked(&mut inner, handle) {
            Ok(fence) => {
                inner.closed += 1;
                drop(inner);
                fence.close();
                Ok(())
            }
            Err(err) => {
                drop(inner);
                if matches!(err, SyncError::DoubleClose(_)) {
                    self.double_closed.fetch_add(1, Ordering::Relaxed);
                }
                tracing::warn!(%handle, "{err}");
                Err(err)
            }
        }
    }

    /// Close an optional handle; `None` is skipped.
    pub fn close_opt(&self, handle: Option<FenceHandle>) -> Result<()> {
        match handle {
            Some(h) => self.close(h),
            None => Ok(()),
        }
    }

    pub fn is_signaled(&self, handle: FenceHandle) -> Result<bool> {
        let inner = self.lock();
        match inner.fences.get(&handle) {
            Some(fence) => Ok(fence.is_signaled()),
            None => Err(Self::missing(&inner, handle)),
        }
    }

    /// AND-compose two optional handles; both inputs are consumed when both are present.
    pub fn merge(
        &self,
        a: Option<FenceHandle>,
        b: Option<FenceHandle>,
    ) -> Result<Option<FenceHandle>> {
        let (a, b) = match (a, b) {
            (None, other) | (other, None) => return Ok(other),
            (Some(a), Some(b)) => (a, b),
        };
        let mut inner = self.lock();
        if !inner.fences.contains_key(&a) {
            return Err(Self::missing(&inner, a));
        }
        if a == b {
            // Merging a live fence with itself is the fence itself.
            return Ok(Some(a));
        }
        if !inner.fences.contains_key(&b) {
            return Err(Self::missing(&inner, b));
        }
        let fa = Self::take_locked(&mut inner, a)?;
        let fb = Self::take_locked(&mut inner, b)?;
        inner.closed += 2;
        match Fence::merge(Some(fa), Some(fb)) {
            Some(merged) => Self::insert_locked(&mut inner, merged).map(Some),
            None => Ok(None),
        }
    }

    /// Duplicate `src` into `dest`, merging when `dest` already holds a fence.
    ///
    /// `src` stays valid; `dest` (if any) is consumed and replaced by the returned handle.
    pub fn dup(&self, dest: Option<FenceHandle>, src: FenceHandle) -> Result<FenceHandle> {
        let mut inner = self.lock();
        let copy = match inner.fences.get(&src) {
            Some(fence) => fence.dup(),
            None => return Err(Self::missing(&inner, src)),
        };
        let dest = match dest {
            Some(d) if d == src => None,
            Some(d) => {
                let fence = Self::take_locked(&mut inner, d)?;
                inner.closed += 1;
                Some(fence)
            }
            None => None,
        };
        let fence = Fence::dup_into(dest, &copy);
        Self::insert_locked(&mut inner, fence)
    }

    /// Wait on a handle without consuming it.
    ///
    /// The table lock is not held while blocking; the wait runs on a duplicate of the fence.
    pub fn wait(&self, handle: FenceHandle, timeout: Duration) -> Result<WaitOutcome> {
        let copy = {
            let inner = self.lock();
            match inner.fences.get(&handle) {
                Some(fence) => fence.dup(),
                None => return Err(Self::missing(&inner, handle)),
            }
        };
        copy.wait_and_close(timeout)
    }

    /// Wait on a handle and close it afterwards, including when the wait times out.
    pub fn wait_and_close(&self, handle: FenceHandle, timeout: Duration) -> Result<WaitOutcome> {
        let fence = {
            let mut inner = self.lock();
            let fence = Self::take_locked(&mut inner, handle)?;
            inner.closed += 1;
            fence
        };
        fence.wait_and_close(timeout)
    }

    pub fn len(&self) -> usize {
        self.lock().fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FenceTableStats {
        let inner = self.lock();
        FenceTableStats {
            live: inner.fences.len(),
            closed: inner.closed,
            double_closed: self.double_closed.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
